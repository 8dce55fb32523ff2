use serde::{Deserialize, Serialize};

/// A device allowed to submit telemetry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: String,
    pub created_at: i64,
}

/// One accepted sample, in device-native units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TelemetrySample {
    pub device_id: String,
    pub ts: i64,
    #[serde(rename = "current_mA")]
    #[sqlx(rename = "current_mA")]
    pub current_ma: i64,
    #[serde(rename = "power_dW")]
    #[sqlx(rename = "power_dW")]
    pub power_dw: i64,
    #[serde(rename = "temp_cC")]
    #[sqlx(rename = "temp_cC")]
    pub temp_cc: i64,
}

/// Decrypted `/register` body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub device_id: String,
}

/// Decrypted `/data` body, already validated at the parse boundary.
///
/// `samples` holds only the records that passed coercion and the `ts > 0`
/// filter; `skipped` counts the ones that were dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    pub device_id: String,
    pub nonce: String,
    pub samples: Vec<TelemetrySample>,
    pub skipped: usize,
}

/// JSON body of every non-time response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// `/sync_time` response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeResponse {
    pub ts: i64,
}
