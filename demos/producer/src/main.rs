//! Sends test temperature readings to an SQS-compatible queue.
//!
//! ```text
//! SENSORQ_QUEUE_URL=http://localhost:4566/000000000000/sensor-readings \
//! SENSORQ_ENDPOINT_URL=http://localhost:4566 \
//! cargo run -p sensorq-producer -- 10
//! ```

use aws_config::{BehaviorVersion, Region};
use rand::Rng;

const LOCATION: &str = "Cape Town";

#[tokio::main]
async fn main() -> Result<(), eyre::Report> {
    tracing_subscriber::fmt::init();

    let count: usize = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(5);

    let queue_url = std::env::var("SENSORQ_QUEUE_URL")
        .map_err(|_| eyre::eyre!("SENSORQ_QUEUE_URL must be set"))?;
    let region = std::env::var("SENSORQ_REGION").unwrap_or_else(|_| "us-east-1".to_owned());

    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region));
    if let Ok(endpoint) = std::env::var("SENSORQ_ENDPOINT_URL") {
        loader = loader.endpoint_url(endpoint);
    }
    let sqs = aws_sdk_sqs::Client::new(&loader.load().await);

    let batch = chrono::Utc::now().timestamp();
    for i in 0..count {
        let value: f64 = rand::thread_rng().gen_range(15.0..35.0);

        let body = serde_json::json!({
            "reading_id": format!("demo-{batch}-{i}"),
            "sensor_type": "temperature",
            "value": (value * 10.0).round() / 10.0,
            "location_name": LOCATION,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        let res = sqs
            .send_message()
            .queue_url(&queue_url)
            .message_body(body.to_string())
            .send()
            .await?;

        tracing::info!(message_id = ?res.message_id(), %body, "Sent reading");
    }

    Ok(())
}
