//! JSON wire codec.
//!
//! Framing is the transport's job; these helpers only turn values into frame
//! bodies and back.

use crate::protocol::Package;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(bytes)
}

pub fn encode_package(package: &Package) -> Result<Vec<u8>, serde_json::Error> {
    encode(package)
}

pub fn decode_package(bytes: &[u8]) -> Result<Package, serde_json::Error> {
    decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MailBox;
    use crate::protocol::{HostCommand, HostCommandType};
    use crate::value::{DictKey, PropValue, WireValue};

    #[test]
    fn test_wire_values_survive_encoding() {
        let value = WireValue::Composite {
            type_name: "Avatar".to_string(),
            fields: vec![
                ("tags".to_string(), WireValue::List(vec![])),
                ("bag".to_string(), WireValue::Dict(vec![])),
                (
                    "owners".to_string(),
                    WireValue::Dict(vec![(
                        DictKey::MailBox(MailBox::new("p1", "10.0.0.1", 7000, 2)),
                        WireValue::Scalar(PropValue::Bool(true)),
                    )]),
                ),
                ("hp".to_string(), WireValue::Scalar(PropValue::Float(12.5))),
            ],
        };
        let decoded: WireValue = decode(&encode(&value).unwrap()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_package_tagging() {
        let package = Package::HostCommand(HostCommand::new(
            HostCommandType::SyncGates,
            vec![MailBox::new("gate0", "127.0.0.1", 7100, 1)],
        ));
        let bytes = encode_package(&package).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"type\":\"HostCommand\""));
        assert_eq!(decode_package(&bytes).unwrap(), package);
        assert!(decode_package(b"{\"type\":\"Nope\"}").is_err());
    }
}
