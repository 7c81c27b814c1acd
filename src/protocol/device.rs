use plist::{Dictionary, Value};

/// Size of the serial number field in the legacy device record.
pub const SERIAL_NUMBER_SIZE: usize = 256;

/// Size of the packed legacy device record:
/// \[device_id u32\]\[product_id u16\]\[serial 256\]\[padding u16\]\[location u32\].
pub const DEVICE_RECORD_SIZE: usize = 4 + 2 + SERIAL_NUMBER_SIZE + 2 + 4;

/// A device as reported by the remote multiplexer.
///
/// Plist listeners receive the dictionary verbatim; legacy listeners receive
/// the fields below packed into a fixed-size binary record.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    dict: Dictionary,
}

impl DeviceRecord {
    /// Builds the standard `Attached` dictionary for a device.
    pub fn new(device_id: u32, serial_number: &str, location: u32, product_id: u16) -> Self {
        let mut properties = Dictionary::new();
        properties.insert("DeviceID".into(), Value::from(u64::from(device_id)));
        properties.insert("SerialNumber".into(), Value::from(serial_number));
        properties.insert("LocationID".into(), Value::from(u64::from(location)));
        properties.insert("ProductID".into(), Value::from(u64::from(product_id)));
        properties.insert("ConnectionType".into(), Value::from("USB"));

        let mut dict = Dictionary::new();
        dict.insert("MessageType".into(), Value::from("Attached"));
        dict.insert("DeviceID".into(), Value::from(u64::from(device_id)));
        dict.insert("Properties".into(), Value::Dictionary(properties));
        Self { dict }
    }

    /// Wraps a dictionary supplied by the remote multiplexer.
    pub fn from_dictionary(dict: Dictionary) -> Self {
        Self { dict }
    }

    pub fn as_dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn to_value(&self) -> Value {
        Value::Dictionary(self.dict.clone())
    }

    pub fn device_id(&self) -> u32 {
        self.dict
            .get("DeviceID")
            .and_then(Value::as_unsigned_integer)
            .unwrap_or(0) as u32
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.property("SerialNumber").and_then(Value::as_string)
    }

    pub fn location(&self) -> u32 {
        self.property("LocationID")
            .and_then(Value::as_unsigned_integer)
            .unwrap_or(0) as u32
    }

    pub fn product_id(&self) -> u16 {
        self.property("ProductID")
            .and_then(Value::as_unsigned_integer)
            .unwrap_or(0) as u16
    }

    /// Packs the legacy binary record.
    ///
    /// The serial number is truncated to 255 bytes so the field always ends
    /// with a NUL.
    pub fn to_legacy_bytes(&self) -> [u8; DEVICE_RECORD_SIZE] {
        let mut out = [0u8; DEVICE_RECORD_SIZE];
        out[0..4].copy_from_slice(&self.device_id().to_le_bytes());
        out[4..6].copy_from_slice(&self.product_id().to_le_bytes());
        if let Some(serial) = self.serial_number() {
            let bytes = serial.as_bytes();
            let n = bytes.len().min(SERIAL_NUMBER_SIZE - 1);
            out[6..6 + n].copy_from_slice(&bytes[..n]);
        }
        let location_at = 6 + SERIAL_NUMBER_SIZE + 2;
        out[location_at..location_at + 4].copy_from_slice(&self.location().to_le_bytes());
        out
    }

    fn property(&self, key: &str) -> Option<&Value> {
        self.dict
            .get("Properties")
            .and_then(Value::as_dictionary)
            .and_then(|properties| properties.get(key))
    }
}
