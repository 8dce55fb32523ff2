use rand::Rng;
use serde::{Deserialize, Serialize};

/// One sample as the firmware reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub ts: i64,
    #[serde(rename = "current_mA")]
    pub current_ma: i64,
    #[serde(rename = "power_dW")]
    pub power_dw: i64,
    #[serde(rename = "temp_cC")]
    pub temp_cc: i64,
}

#[derive(Debug, Serialize)]
pub struct RegisterPayload<'a> {
    pub device_id: &'a str,
    pub nonce: &'a str,
}

#[derive(Debug, Serialize)]
pub struct DataPayload<'a> {
    pub device_id: &'a str,
    pub nonce: &'a str,
    pub records: &'a [Record],
}

#[derive(Debug, Deserialize)]
pub struct StatusReply {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct TimeReply {
    pub ts: i64,
}

/// Hex nonce in the firmware's format.
pub fn nonce(rng: &mut impl Rng) -> String {
    format!("{:x}", rng.gen::<u32>())
}

/// `count` samples ending at `end_ts`, one per `step_secs`.
pub fn generate_records(rng: &mut impl Rng, end_ts: i64, count: usize, step_secs: i64) -> Vec<Record> {
    (0..count)
        .rev()
        .map(|i| {
            let current_ma = if rng.gen_bool(0.05) {
                rng.gen_range(0..5_000) // 5% load spikes
            } else {
                rng.gen_range(200..800)
            };
            // 12 V supply, in tenths of a watt
            let power_dw = current_ma * 12 / 100;

            Record {
                ts: end_ts - i as i64 * step_secs,
                current_ma,
                power_dw,
                temp_cc: rng.gen_range(1_500..4_500),
            }
        })
        .collect()
}
