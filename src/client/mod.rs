pub mod device;

pub use device::DeviceClient;

/// Device category codes reported in the info reply's `dtp` field (and in
/// catalog groups).
pub const SWITCH_TYPE_CODE: &str = "00";
pub const LIGHT_TYPE_CODE: &str = "01";
pub const ENERGY_STORAGE_TYPE_CODE: &str = "02";

/// Model name used when the catalog has no entry for the product id.
pub fn default_model_name(type_code: &str) -> &'static str {
    match type_code {
        SWITCH_TYPE_CODE => "Switch",
        LIGHT_TYPE_CODE => "Light",
        ENERGY_STORAGE_TYPE_CODE => "Energy Storage",
        _ => "CozyLife Device",
    }
}

/// Identity established by the info handshake.
///
/// Immutable once built: a reconnect publishes a whole new value, so readers
/// see either the previous complete identity or the new one, never a mix.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub product_id: String,
    /// Category code, e.g. "00"/"01"/"02". From the device's own report when
    /// present, otherwise from the catalog.
    pub type_code: String,
    pub model_name: String,
    pub icon: Option<String>,
    /// DPIDs the product supports, per the catalog. Empty without a
    /// catalog match.
    pub dpids: Vec<u32>,
}
