//! AWS SQS (or any SQS-compatible endpoint) as a [`MessageSource`].

use std::{collections::HashMap, time::Duration};

use aws_config::BehaviorVersion;
use aws_sdk_sqs::{
    config::Region,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    types::{Message, MessageAttributeValue, MessageSystemAttributeName},
    Client,
};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;

use super::{BrokerError, MessageSource};
use crate::{
    config::Config,
    error::Error,
    message::{ReceiptHandle, SensorMessage, DEAD_LETTER_REASON_ATTRIBUTE},
};

/// SQS rejects visibility timeouts above 12 hours.
const MAX_VISIBILITY_SECS: u64 = 43_200;

/// Service error codes that are worth retrying.
const TRANSIENT_CODES: &[&str] = &[
    "ThrottlingException",
    "RequestThrottled",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
];

pub struct SqsSource {
    client: Client,
    queue_url: String,
    dead_letter_url: String,
    visibility_timeout: Duration,
}

impl SqsSource {
    pub fn new(
        client: Client,
        queue_url: impl Into<String>,
        dead_letter_url: impl Into<String>,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            dead_letter_url: dead_letter_url.into(),
            visibility_timeout,
        }
    }

    pub async fn connect_with(config: &Config) -> Result<Self, Error> {
        let queue_url = config
            .queue_url
            .as_ref()
            .ok_or_else(|| Error::invalid_config("sqs backend requires queue_url"))?;
        let dead_letter_url = config
            .dead_letter_url
            .as_ref()
            .ok_or_else(|| Error::invalid_config("sqs backend requires dead_letter_url"))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region().to_owned()));
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint.as_str());
        }
        let sdk_config = loader.load().await;

        Ok(Self::new(
            Client::new(&sdk_config),
            queue_url.as_str(),
            dead_letter_url.as_str(),
            config.visibility_timeout(),
        ))
    }

    /// Sends a raw body to the live queue. Returns the broker's message id.
    pub async fn enqueue(
        &self,
        body: impl Into<String>,
        attributes: HashMap<String, String>,
    ) -> Result<Option<String>, BrokerError> {
        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body);

        for (key, value) in attributes {
            request = request.message_attributes(key, string_attribute("enqueue", value)?);
        }

        let response = request.send().await.map_err(|e| classify("enqueue", e))?;

        Ok(response.message_id)
    }

    async fn change_visibility(
        &self,
        operation: &'static str,
        message: &SensorMessage,
        duration: Duration,
    ) -> Result<(), BrokerError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(message.receipt.as_str())
            .visibility_timeout(whole_secs(duration))
            .send()
            .await
            .map_err(|e| classify(operation, e))?;

        Ok(())
    }
}

/// Rounds up to whole seconds, clamped to what SQS accepts.
fn whole_secs(duration: Duration) -> i32 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.min(MAX_VISIBILITY_SECS) as i32
}

fn string_attribute(
    operation: &'static str,
    value: impl Into<String>,
) -> Result<MessageAttributeValue, BrokerError> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
        .map_err(|e| BrokerError::rejected(operation, e))
}

fn classify<E, R>(operation: &'static str, e: SdkError<E, R>) -> BrokerError
where
    E: std::error::Error + ProvideErrorMetadata + 'static,
    R: std::fmt::Debug,
{
    let transient = match &e {
        SdkError::ServiceError(_) => e.code().is_some_and(|code| TRANSIENT_CODES.contains(&code)),
        _ => true,
    };

    let message = DisplayErrorContext(&e).to_string();
    if transient {
        BrokerError::unavailable(operation, message)
    } else {
        BrokerError::rejected(operation, message)
    }
}

fn to_sensor_message(message: Message) -> Option<SensorMessage> {
    let system = message.attributes.unwrap_or_default();

    let delivery_count = system
        .get(&MessageSystemAttributeName::ApproximateReceiveCount)
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    let enqueued_at = system
        .get(&MessageSystemAttributeName::SentTimestamp)
        .and_then(|v| v.parse().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let attributes = message
        .message_attributes
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, value)| value.string_value.map(|v| (key, v)))
        .collect();

    Some(SensorMessage {
        message_id: message.message_id?,
        receipt: ReceiptHandle::new(message.receipt_handle?),
        body: message.body.unwrap_or_default(),
        attributes,
        delivery_count,
        enqueued_at,
    })
}

impl MessageSource for SqsSource {
    fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> BoxFuture<'_, Result<Vec<SensorMessage>, BrokerError>> {
        Box::pin(async move {
            let response = self
                .client
                .receive_message()
                .queue_url(&self.queue_url)
                .max_number_of_messages(max_messages.clamp(1, 10) as i32)
                .wait_time_seconds(wait_time.as_secs().min(20) as i32)
                .visibility_timeout(whole_secs(self.visibility_timeout))
                .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
                .message_system_attribute_names(MessageSystemAttributeName::SentTimestamp)
                .message_attribute_names("All")
                .send()
                .await
                .map_err(|e| classify("receive", e))?;

            let messages: Vec<_> = response
                .messages
                .unwrap_or_default()
                .into_iter()
                .filter_map(to_sensor_message)
                .collect();

            tracing::debug!(count = messages.len(), "Received messages from SQS");

            Ok(messages)
        })
    }

    fn extend_visibility<'a>(
        &'a self,
        message: &'a SensorMessage,
        duration: Duration,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(self.change_visibility("extend_visibility", message, duration))
    }

    fn delete<'a>(&'a self, message: &'a SensorMessage) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let result = self
                .client
                .delete_message()
                .queue_url(&self.queue_url)
                .receipt_handle(message.receipt.as_str())
                .send()
                .await;

            match result {
                Ok(_) => Ok(()),
                Err(e)
                    if e.as_service_error()
                        .is_some_and(|se| se.is_receipt_handle_is_invalid()) =>
                {
                    tracing::warn!(
                        message_id = %message.message_id,
                        receipt = %message.receipt,
                        "Delete of stale or unknown receipt handle ignored"
                    );
                    Ok(())
                }
                Err(e) => Err(classify("delete", e)),
            }
        })
    }

    fn dead_letter<'a>(
        &'a self,
        message: &'a SensorMessage,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let operation = "dead_letter";

            let mut request = self
                .client
                .send_message()
                .queue_url(&self.dead_letter_url)
                .message_body(&message.body)
                .message_attributes(
                    DEAD_LETTER_REASON_ATTRIBUTE,
                    string_attribute(operation, reason)?,
                )
                .message_attributes(
                    "original_message_id",
                    string_attribute(operation, &message.message_id)?,
                );

            // SQS allows 10 attributes per message; the two above take priority.
            for (key, value) in message
                .attributes
                .iter()
                .filter(|(key, _)| key.as_str() != DEAD_LETTER_REASON_ATTRIBUTE)
                .take(8)
            {
                request = request.message_attributes(key, string_attribute(operation, value)?);
            }

            request.send().await.map_err(|e| classify(operation, e))?;

            // A failure here leaves the message on the live queue; it will be
            // redelivered and may be dead-lettered a second time.
            self.delete(message).await
        })
    }

    fn release<'a>(
        &'a self,
        message: &'a SensorMessage,
        delay: Duration,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(self.change_visibility("release", message, delay))
    }

    fn name(&self) -> &'static str {
        "sqs"
    }
}
