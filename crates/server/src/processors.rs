//! Built-in job processors.

use bazaar_queue::{HandlerError, Job, JobQueue};
use serde::Deserialize;
use tracing::info;

/// Outgoing mail.
pub const EMAIL_QUEUE: &str = "emails";
/// Search index maintenance.
pub const SEARCH_QUEUE: &str = "search";

/// Queues processed by this server.
pub const QUEUES: [&str; 2] = [EMAIL_QUEUE, SEARCH_QUEUE];

#[derive(Debug, Deserialize)]
struct EmailPayload {
    to: String,
    #[serde(default)]
    template: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexItemPayload {
    item_id: String,
}

async fn send_email(job: Job) -> Result<(), HandlerError> {
    let payload: EmailPayload = serde_json::from_value(job.payload)?;
    if !payload.to.contains('@') {
        return Err(format!("invalid recipient address: {}", payload.to).into());
    }

    info!(
        job_id = %job.id,
        to = %payload.to,
        template = payload.template.as_deref().unwrap_or("default"),
        "Sending email"
    );
    Ok(())
}

async fn index_item(job: Job) -> Result<(), HandlerError> {
    let payload: IndexItemPayload = serde_json::from_value(job.payload)?;
    info!(job_id = %job.id, item_id = %payload.item_id, "Indexing item");
    Ok(())
}

async fn remove_item(job: Job) -> Result<(), HandlerError> {
    let payload: IndexItemPayload = serde_json::from_value(job.payload)?;
    info!(job_id = %job.id, item_id = %payload.item_id, "Removing item from index");
    Ok(())
}

/// Register every built-in processor.
pub async fn register(queue: &JobQueue) {
    queue.register_processor(EMAIL_QUEUE, "email", send_email).await;
    queue.register_processor(SEARCH_QUEUE, "index-item", index_item).await;
    queue.register_processor(SEARCH_QUEUE, "remove-item", remove_item).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_queue::JobOptions;
    use chrono::Utc;
    use serde_json::{Value, json};

    fn job(job_type: &str, payload: Value) -> Job {
        Job::new(
            format!("{job_type}:test"),
            "test",
            job_type,
            payload,
            &JobOptions::default(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_send_email_validates_payload() {
        assert!(send_email(job("email", json!({"to": "a@b.com"}))).await.is_ok());
        assert!(send_email(job("email", json!({"to": "nobody"}))).await.is_err());
        assert!(send_email(job("email", json!({}))).await.is_err());
    }

    #[tokio::test]
    async fn test_index_item_requires_item_id() {
        assert!(index_item(job("index-item", json!({"itemId": "42"}))).await.is_ok());
        assert!(remove_item(job("remove-item", json!({"item": "42"}))).await.is_err());
    }
}
