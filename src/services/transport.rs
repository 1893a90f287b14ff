use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub external_id: String,
}

/// The opaque outbound send capability. The embedding platform supplies
/// the real channel client; courier only needs these three operations.
#[async_trait::async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, address: &str, body: &str) -> anyhow::Result<DeliveryReceipt>;

    /// Lookup used when a group contact carries a display name instead of
    /// a structural group address.
    async fn find_group_by_subject(&self, subject: &str) -> anyhow::Result<Option<String>>;
}

/// Transport that logs instead of sending, for local runs without a
/// channel connection.
#[derive(Default)]
pub struct DryRunTransport;

#[async_trait::async_trait]
impl MessageTransport for DryRunTransport {
    async fn send(&self, address: &str, body: &str) -> anyhow::Result<DeliveryReceipt> {
        let external_id = format!("out_{}", Uuid::new_v4().as_simple());
        tracing::info!(
            address = %address,
            body_len = body.len(),
            external_id = %external_id,
            "transport: dry-run send"
        );
        Ok(DeliveryReceipt { external_id })
    }

    async fn find_group_by_subject(&self, subject: &str) -> anyhow::Result<Option<String>> {
        tracing::debug!(subject = %subject, "transport: dry-run group lookup");
        Ok(None)
    }
}
