use super::AppContext;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use serde_json::json;
use tracing::info;
use watch_sync_core::RawSink;

/// Ping InfluxDB, then write a check point into both buckets.
pub async fn run_test_sink(ctx: &AppContext) -> Result<()> {
    let output = ctx.output;
    ctx.config.validate(true)?;
    let sink = ctx
        .influx_sink()?
        .ok_or_else(|| eyre!("InfluxDB export is disabled (ENABLE_INFLUX=false)"))?;
    let settings = sink.settings().clone();

    sink.ping()
        .await
        .wrap_err_with(|| format!("InfluxDB at {} is not reachable", settings.url))?;
    output.success(format!("Reached {}", settings.url));

    sink.check_buckets()
        .await
        .wrap_err("Check write failed; check the token permissions and bucket names")?;
    info!(
        operation = "test_sink",
        bucket_raw = %settings.bucket_raw,
        bucket_agg = %settings.bucket_agg,
        "Check points written"
    );

    if output.is_json() {
        output.json(&json!({
            "status": "ok",
            "url": settings.url,
            "org": settings.org,
            "buckets": [settings.bucket_raw, settings.bucket_agg],
        }));
    } else {
        output.success(format!(
            "Wrote check points to '{}' and '{}'",
            settings.bucket_raw, settings.bucket_agg
        ));
    }
    Ok(())
}
