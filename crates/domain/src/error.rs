use thiserror::Error;

/// Classified failure of a single Modbus request.
///
/// An `Exception` is an answer from a live device and is surfaced to callers
/// as data; the remaining variants describe link-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    #[error("request timed out")]
    Timeout,

    #[error("CRC check failed: {0}")]
    Crc(String),

    #[error("Modbus exception code {0}")]
    Exception(u8),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("{0}")]
    Other(String),
}

impl ModbusError {
    /// Whether the failure still proves a device answered on the bus.
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Exception(_))
    }
}

/// Gateway-level errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("driver not found: {0}")]
    DriverNotFound(String),

    #[error("invalid driver field {field}: {message}")]
    DriverValidation { field: String, message: String },

    #[error("driver metadata error: {0}")]
    DriverMetadata(String),

    #[error("MQTT connection error: {0}")]
    MqttConnection(String),

    #[error("MQTT client not initialized")]
    MqttNotInitialized,

    #[error("MQTT client not connected")]
    MqttNotConnected,

    #[error("MQTT operation failed: {0}")]
    MqttOperation(String),

    #[error(transparent)]
    Modbus(#[from] ModbusError),

    #[error("unknown data points: {}", .0.join(", "))]
    UnknownDataPoints(Vec<String>),

    #[error("data point {0} is not readable")]
    NotReadable(String),

    #[error("data point {0} is not writable")]
    NotWritable(String),

    #[error("duplicate device: {0}")]
    DuplicateDevice(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("handler error: {0}")]
    Handler(String),
}
