use sensorq::sink::LogSink;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    sensorq::run().sink(LogSink).start().await
}
