//! Detector construction: tagged dispatch over the connection's provider.

use std::time::Duration;

use super::detector::ZombieDetector;
use super::{aws, azure, gcp};
use crate::domains::connections::{build_adapter, CloudConnection, Provider};

/// Build the detector for a connection: provider client from the connection
/// credentials, plugin set per provider.
pub fn detector_for_connection(
    connection: &CloudConnection,
    region: Option<&str>,
    plugin_timeout: Duration,
) -> ZombieDetector {
    let api = build_adapter(connection, region);
    let plugins = match connection.provider() {
        Provider::Aws => aws::plugins(),
        Provider::Azure => azure::plugins(),
        Provider::Gcp => gcp::plugins(),
    };

    ZombieDetector::new(
        connection.provider(),
        connection.scan_region(region),
        api,
        plugins,
        plugin_timeout,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::connections::{AwsConnection, AzureConnection};
    use uuid::Uuid;

    #[test]
    fn aws_detector_carries_full_plugin_set() {
        let connection = CloudConnection::Aws(AwsConnection {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "prod".into(),
            region: "us-east-1".into(),
            aws_account_id: "123456789012".into(),
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "secret".into(),
            last_ingested_at: None,
            error_message: None,
        });
        let detector = detector_for_connection(&connection, None, Duration::from_secs(30));
        assert_eq!(detector.provider(), Provider::Aws);
        assert_eq!(detector.plugin_count(), 11);
    }

    #[test]
    fn azure_detector_scans_globally() {
        let connection = CloudConnection::Azure(AzureConnection {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "corp".into(),
            azure_tenant_id: "t".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
            subscription_id: "sub".into(),
            last_ingested_at: None,
            error_message: None,
        });
        let detector = detector_for_connection(&connection, Some("us-east-1"), Duration::from_secs(30));
        assert_eq!(detector.provider(), Provider::Azure);
        assert_eq!(detector.plugin_count(), 2);
    }
}
