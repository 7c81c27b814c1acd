use super::{DeviceRecord, Frame, MessageType, ProtocolVariant, ResultCode};
use crate::error::Error;
use plist::{Dictionary, Value};

/// Connection type reported for every listener.
const LISTENER_CONN_TYPE: u64 = 0;

/// Builds a `Result` reply in the connection's wire family.
pub fn result_frame(variant: ProtocolVariant, tag: u32, code: ResultCode) -> Result<Frame, Error> {
    match variant {
        ProtocolVariant::Plist => {
            let mut dict = Dictionary::new();
            dict.insert("MessageType".into(), Value::from("Result"));
            dict.insert("Number".into(), Value::from(u64::from(code.0)));
            plist_frame(variant, tag, &Value::Dictionary(dict))
        }
        ProtocolVariant::Legacy => Ok(Frame::new(
            variant,
            MessageType::Result,
            tag,
            code.0.to_le_bytes().to_vec(),
        )),
    }
}

/// Wraps a property list as XML in a `Plist` frame.
pub fn plist_frame(variant: ProtocolVariant, tag: u32, message: &Value) -> Result<Frame, Error> {
    let mut xml = Vec::new();
    message.to_writer_xml(&mut xml)?;
    Ok(Frame::new(variant, MessageType::Plist, tag, xml))
}

/// Builds a device arrival notification; always tag 0.
pub fn device_add_frame(variant: ProtocolVariant, device: &DeviceRecord) -> Result<Frame, Error> {
    match variant {
        ProtocolVariant::Plist => plist_frame(variant, 0, &device.to_value()),
        ProtocolVariant::Legacy => Ok(Frame::new(
            variant,
            MessageType::DeviceAdd,
            0,
            device.to_legacy_bytes().to_vec(),
        )),
    }
}

/// Builds a device removal notification; always tag 0.
pub fn device_remove_frame(variant: ProtocolVariant, device_id: u32) -> Result<Frame, Error> {
    match variant {
        ProtocolVariant::Plist => {
            let mut dict = Dictionary::new();
            dict.insert("MessageType".into(), Value::from("Detached"));
            dict.insert("DeviceID".into(), Value::from(u64::from(device_id)));
            plist_frame(variant, 0, &Value::Dictionary(dict))
        }
        ProtocolVariant::Legacy => Ok(Frame::new(
            variant,
            MessageType::DeviceRemove,
            0,
            device_id.to_le_bytes().to_vec(),
        )),
    }
}

/// `{DeviceList: [...]}`
pub fn device_list_message(devices: &[DeviceRecord]) -> Value {
    let list = devices.iter().map(DeviceRecord::to_value).collect::<Vec<_>>();
    let mut dict = Dictionary::new();
    dict.insert("DeviceList".into(), Value::Array(list));
    Value::Dictionary(dict)
}

/// `{Instances: <opaque>}`
pub fn instances_message(instances: Value) -> Value {
    let mut dict = Dictionary::new();
    dict.insert("Instances".into(), instances);
    Value::Dictionary(dict)
}

/// One row of a `ListListeners` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerEntry {
    pub connection_id: usize,
    pub bundle_id: Option<String>,
    pub prog_name: Option<String>,
    pub lib_version: Option<u64>,
}

impl ListenerEntry {
    pub fn to_value(&self) -> Value {
        let prog_name = self.prog_name.as_deref().unwrap_or("unknown");

        let mut dict = Dictionary::new();
        dict.insert("Blacklisted".into(), Value::from(false));
        if let Some(bundle_id) = &self.bundle_id {
            dict.insert("BundleID".into(), Value::from(bundle_id.as_str()));
        }
        dict.insert("ConnType".into(), Value::from(LISTENER_CONN_TYPE));
        dict.insert(
            "ID String".into(),
            Value::from(format!("{}-{}", self.connection_id, prog_name)),
        );
        dict.insert("ProgName".into(), Value::from(prog_name));
        dict.insert(
            "kLibUSBMuxVersion".into(),
            Value::from(self.lib_version.unwrap_or(0)),
        );
        Value::Dictionary(dict)
    }
}

/// `{ListenerList: [...]}`
pub fn listener_list_message(listeners: &[ListenerEntry]) -> Value {
    let list = listeners.iter().map(ListenerEntry::to_value).collect::<Vec<_>>();
    let mut dict = Dictionary::new();
    dict.insert("ListenerList".into(), Value::Array(list));
    Value::Dictionary(dict)
}
