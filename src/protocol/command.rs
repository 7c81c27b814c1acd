use super::{Header, MessageType, ResultCode};
use crate::error::Error;
use plist::{Dictionary, Value};
use std::io::Cursor;
use tracing::trace;

/// A client request decoded from either wire family.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Listen,
    /// Open a channel to `port` on `device_id`.
    ///
    /// `port` is kept exactly as the client sent it (network byte order) and
    /// `request` is the plist form forwarded to the remote multiplexer.
    Connect {
        device_id: u32,
        port: u16,
        request: Dictionary,
    },
    ListDevices,
    ListListeners,
    ReadBuid,
    ReadPairRecord {
        record_id: Option<String>,
    },
    SavePairRecord {
        record_id: Option<String>,
        request: Dictionary,
    },
    DeletePairRecord {
        record_id: Option<String>,
    },
    Instances,
    AddInstance {
        host: String,
        port: u16,
    },
    RemoveInstance {
        host: String,
        port: u16,
    },
    /// A message type or `MessageType` string the daemon does not know.
    Unknown(String),
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Listen => "Listen",
            Command::Connect { .. } => "Connect",
            Command::ListDevices => "ListDevices",
            Command::ListListeners => "ListListeners",
            Command::ReadBuid => "ReadBUID",
            Command::ReadPairRecord { .. } => "ReadPairRecord",
            Command::SavePairRecord { .. } => "SavePairRecord",
            Command::DeletePairRecord { .. } => "DeletePairRecord",
            Command::Instances => "Instances",
            Command::AddInstance { .. } => "AddInstance",
            Command::RemoveInstance { .. } => "RemoveInstance",
            Command::Unknown(name) => name,
        }
    }
}

/// Client metadata carried by plist requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub bundle_id: Option<String>,
    pub version_string: Option<String>,
    pub prog_name: Option<String>,
    pub lib_version: Option<u64>,
}

impl ClientInfo {
    pub fn from_dictionary(dict: &Dictionary) -> Self {
        Self {
            bundle_id: string_field(dict, "BundleID").map(str::to_owned),
            version_string: string_field(dict, "ClientVersionString").map(str::to_owned),
            prog_name: string_field(dict, "ProgName").map(str::to_owned),
            lib_version: dict
                .get("kLibUSBMuxVersion")
                .and_then(Value::as_unsigned_integer),
        }
    }
}

/// Decodes the binary payload of a legacy (non-plist) frame.
pub fn parse_legacy_command(header: &Header, payload: &[u8]) -> Result<Command, Error> {
    match MessageType::from_u32(header.message) {
        Some(MessageType::Listen) => Ok(Command::Listen),
        Some(MessageType::Connect) => {
            // [device_id u32][port u16, network order][reserved u16]
            let (Some(id), Some(port)) = (payload.get(0..4), payload.get(4..6)) else {
                return Err(Error::FrameTooShort {
                    length: header.length,
                });
            };
            let device_id = u32::from_le_bytes([id[0], id[1], id[2], id[3]]);
            let port = u16::from_le_bytes([port[0], port[1]]);

            let mut request = Dictionary::new();
            request.insert("MessageType".into(), Value::from("Connect"));
            request.insert("DeviceID".into(), Value::from(u64::from(device_id)));
            request.insert("PortNumber".into(), Value::from(u64::from(port)));
            Ok(Command::Connect {
                device_id,
                port,
                request,
            })
        }
        _ => Ok(Command::Unknown(format!("message type {}", header.message))),
    }
}

/// Decodes the XML plist payload of a plist frame.
///
/// Returns the command together with the client metadata found in the same
/// dictionary.
pub fn parse_plist_command(payload: &[u8]) -> Result<(Command, ClientInfo), Error> {
    // Some clients NUL-terminate the XML.
    let end = payload
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    let value = Value::from_reader_xml(Cursor::new(&payload[..end]))?;
    let Value::Dictionary(dict) = value else {
        return Err(Error::NotADictionary);
    };

    let message_type = string_field(&dict, "MessageType")
        .ok_or(Error::MissingField {
            field: "MessageType",
            code: ResultCode::BAD_COMMAND,
        })?
        .to_owned();
    trace!(%message_type, "Parsed plist message");

    let info = ClientInfo::from_dictionary(&dict);
    let command = match message_type.as_str() {
        "Listen" => Command::Listen,
        "Connect" => {
            let device_id = uint_field(&dict, "DeviceID", ResultCode::BAD_DEVICE)? as u32;
            let port = uint_field(&dict, "PortNumber", ResultCode::BAD_COMMAND)? as u16;
            Command::Connect {
                device_id,
                port,
                request: dict,
            }
        }
        "ListDevices" => Command::ListDevices,
        "ListListeners" => Command::ListListeners,
        "ReadBUID" => Command::ReadBuid,
        "ReadPairRecord" => Command::ReadPairRecord {
            record_id: record_id(&dict),
        },
        "SavePairRecord" => Command::SavePairRecord {
            record_id: record_id(&dict),
            request: dict,
        },
        "DeletePairRecord" => Command::DeletePairRecord {
            record_id: record_id(&dict),
        },
        "Instances" => Command::Instances,
        "AddInstance" | "RemoveInstance" => {
            let host = string_field(&dict, "HostAddress")
                .ok_or(Error::MissingField {
                    field: "HostAddress",
                    code: ResultCode::BAD_COMMAND,
                })?
                .to_owned();
            let port = uint_field(&dict, "PortNumber", ResultCode::BAD_COMMAND)? as u16;
            if message_type == "AddInstance" {
                Command::AddInstance { host, port }
            } else {
                Command::RemoveInstance { host, port }
            }
        }
        other => Command::Unknown(other.to_owned()),
    };
    Ok((command, info))
}

fn string_field<'a>(dict: &'a Dictionary, key: &str) -> Option<&'a str> {
    dict.get(key).and_then(Value::as_string)
}

fn uint_field(dict: &Dictionary, field: &'static str, code: ResultCode) -> Result<u64, Error> {
    dict.get(field)
        .and_then(Value::as_unsigned_integer)
        .ok_or(Error::MissingField { field, code })
}

fn record_id(dict: &Dictionary) -> Option<String> {
    string_field(dict, "PairRecordID").map(str::to_owned)
}
