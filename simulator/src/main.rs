mod telemetry;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use gateway::envelope::AesCbcHmacCodec;
use rand::rngs::StdRng;
use rand::SeedableRng;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use telemetry::{DataPayload, RegisterPayload, StatusReply, TimeReply};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Simulated devices speaking the gateway's encrypted HTTP protocol.
#[derive(Parser, Debug, Clone)]
#[command(name = "simulator", version)]
struct Args {
    /// Gateway base URL
    #[arg(long, env = "GATEWAY_URL", default_value = "http://localhost:8080")]
    server: String,

    /// Shared envelope secret
    #[arg(long, env = "GATEWAY_SECRET", hide_env_values = true)]
    secret: String,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 5)]
    devices: usize,

    /// Seconds between uploads
    #[arg(long, env = "INTERVAL_SECS", default_value_t = 10)]
    interval_secs: u64,

    /// Samples per upload
    #[arg(long, env = "BATCH_SIZE", default_value_t = 6)]
    batch_size: usize,

    /// Uploads per device; 0 runs until interrupted
    #[arg(long, env = "ROUNDS", default_value_t = 0)]
    rounds: u64,
}

struct Device {
    id: String,
    base_url: String,
    client: reqwest::Client,
    codec: Arc<AesCbcHmacCodec>,
    rng: StdRng,
    clock_offset: i64,
}

impl Device {
    fn now(&self) -> i64 {
        Utc::now().timestamp() + self.clock_offset
    }

    async fn sync_time(&mut self) -> Result<()> {
        let reply: TimeReply = self
            .client
            .get(format!("{}/sync_time", self.base_url))
            .send()
            .await?
            .json()
            .await?;

        self.clock_offset = reply.ts - Utc::now().timestamp();
        info!(device = %self.id, offset = self.clock_offset, "Clock synchronised");
        Ok(())
    }

    async fn register(&mut self) -> Result<()> {
        let nonce = telemetry::nonce(&mut self.rng);
        let payload = RegisterPayload {
            device_id: &self.id,
            nonce: &nonce,
        };

        let reply = self.post_sealed("/register", &payload).await?;
        if reply.status != "OK" {
            bail!("registration refused: {}", reply.status);
        }
        info!(device = %self.id, "Registered");
        Ok(())
    }

    /// Uploads one batch. Re-registers once if the gateway forgot us.
    async fn upload(&mut self, batch_size: usize, step_secs: i64) -> Result<()> {
        let now = self.now();
        let records = telemetry::generate_records(&mut self.rng, now, batch_size, step_secs);

        for attempt in 1..=2 {
            let nonce = telemetry::nonce(&mut self.rng);
            let payload = DataPayload {
                device_id: &self.id,
                nonce: &nonce,
                records: &records,
            };

            let reply = self.post_sealed("/data", &payload).await?;
            match reply.status.as_str() {
                "OK" => {
                    info!(device = %self.id, records = records.len(), "Batch accepted");
                    return Ok(());
                }
                "notreg" if attempt == 1 => {
                    warn!(device = %self.id, "Device not registered, registering");
                    self.register().await?;
                }
                other => bail!("batch rejected: {}", other),
            }
        }

        bail!("batch rejected after re-registration")
    }

    async fn post_sealed<T: Serialize>(&self, path: &str, payload: &T) -> Result<StatusReply> {
        let plain = serde_json::to_vec(payload)?;
        let body = self.codec.encode(&plain);

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", path))?;

        let code = response.status();
        let reply: StatusReply = response
            .json()
            .await
            .with_context(|| format!("unreadable reply from {} ({})", path, code))?;
        Ok(reply)
    }
}

async fn run_device(mut device: Device, args: Arc<Args>) {
    if let Err(e) = device.sync_time().await {
        warn!(device = %device.id, "Time sync failed, using local clock: {:#}", e);
    }
    if let Err(e) = device.register().await {
        error!(device = %device.id, "Registration failed: {:#}", e);
    }

    let step_secs = (args.interval_secs as i64 / args.batch_size.max(1) as i64).max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    let mut round = 0u64;

    loop {
        ticker.tick().await;
        round += 1;

        if let Err(e) = device.upload(args.batch_size, step_secs).await {
            warn!(device = %device.id, "Upload failed: {:#}", e);
        }

        if args.rounds != 0 && round >= args.rounds {
            break;
        }
    }

    info!(device = %device.id, rounds = round, "Device finished");
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Arc::new(Args::parse());

    info!("Starting device simulator");
    info!(
        "Gateway: {}, Devices: {}, Interval: {}s, Batch: {}",
        args.server, args.devices, args.interval_secs, args.batch_size
    );

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    let codec = Arc::new(AesCbcHmacCodec::new(&args.secret));
    let base_url = args.server.trim_end_matches('/').to_string();

    let handles: Vec<_> = (0..args.devices)
        .map(|n| {
            let device = Device {
                id: format!("sim-{:04}", n),
                base_url: base_url.clone(),
                client: client.clone(),
                codec: codec.clone(),
                rng: StdRng::from_entropy(),
                clock_offset: 0,
            };
            tokio::spawn(run_device(device, args.clone()))
        })
        .collect();

    tokio::select! {
        _ = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!("Device task failed: {}", e);
                }
            }
        } => {
            info!("All devices finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }
}
