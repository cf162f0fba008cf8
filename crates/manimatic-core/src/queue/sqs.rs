//! SQS-backed queue implementation.
//!
//! Wraps the AWS SDK with the directional [`MessageQueue`] contract. A
//! single receive pulls at most one message with a 20 second long poll, so
//! callers loop without spinning.

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::SdkError;

use super::{MessageQueue, QueueMessage};
use crate::error::{Error, Result};

/// Long-poll bound for a single receive, in seconds.
const RECEIVE_WAIT_TIME_SECS: i32 = 20;

/// SQS-backed message queue bound to an inbox/outbox URL pair.
#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: Client,
    receive_url: String,
    send_url: String,
}

impl SqsQueue {
    /// Creates a queue handle from an existing SQS client.
    #[must_use]
    pub fn new(client: Client, receive_url: impl Into<String>, send_url: impl Into<String>) -> Self {
        Self {
            client,
            receive_url: receive_url.into(),
            send_url: send_url.into(),
        }
    }

    /// Connects to SQS using ambient AWS credentials.
    ///
    /// `endpoint_url` overrides the service endpoint for local stacks.
    pub async fn connect(
        endpoint_url: Option<&str>,
        receive_url: impl Into<String>,
        send_url: impl Into<String>,
    ) -> Self {
        let aws_config =
            aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
        let mut builder = aws_sdk_sqs::config::Builder::from(&aws_config);
        if let Some(endpoint) = endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        let client = Client::from_conf(builder.build());
        Self::new(client, receive_url, send_url)
    }

    /// Returns the inbox URL this handle receives from.
    #[must_use]
    pub fn receive_url(&self) -> &str {
        &self.receive_url
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn receive(&self) -> Result<QueueMessage> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.receive_url)
            .max_number_of_messages(1)
            .wait_time_seconds(RECEIVE_WAIT_TIME_SECS)
            .send()
            .await
            .map_err(|e| {
                if matches!(&e, SdkError::ServiceError(service_err)
                    if service_err.err().is_queue_does_not_exist())
                {
                    Error::QueueNotExist {
                        url: self.receive_url.clone(),
                    }
                } else {
                    Error::queue_with_source("receive failed", e)
                }
            })?;

        let message = output
            .messages
            .and_then(|mut messages| messages.pop())
            .ok_or(Error::NoMessages)?;

        let body = message
            .body
            .ok_or_else(|| Error::queue("received message without a body"))?;
        let receipt_handle = message
            .receipt_handle
            .ok_or_else(|| Error::queue("received message without a receipt handle"))?;

        Ok(QueueMessage {
            message_id: message.message_id.unwrap_or_default(),
            body,
            receipt_handle,
        })
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.receive_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| Error::queue_with_source("delete failed", e))?;
        Ok(())
    }

    async fn send(&self, body: String) -> Result<()> {
        self.client
            .send_message()
            .queue_url(&self.send_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| Error::queue_with_source("send failed", e))?;
        Ok(())
    }
}
