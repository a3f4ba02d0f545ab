use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};

/// The distinguished event whose subscription doubles as a full-state sync:
/// the server answers `EventAdd` for this event with the object's current
/// state, and every later property change is pushed under this name.
pub const STATE_CHANGED_EVENT: &str = "PropertyChanged";

/// Message kinds carried on the wire.
///
/// `RootQuery` bootstraps a fresh connection (nil `dtoGuid`); everything else
/// addresses a specific remote object. `EventNotification` is the only
/// server-initiated kind.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum MessageType {
    #[default]
    RootQuery,
    Query,
    Get,
    Set,
    Invoke,
    EventAdd,
    EventRemove,
    EventNotification,
}

/// The single wire message: request, response, or push notification.
///
/// One envelope per WebSocket text frame, JSON-encoded with the field names
/// of the wire contract (`messageGuid`, `dtoGuid`, ...). `message_guid`
/// correlates a response to its request; `dto_guid` identifies the remote
/// object (nil for the bootstrap query). A response carries either `response`
/// or `error`, never both.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub message_guid: Uuid,
    #[serde(default)]
    pub dto_guid: Uuid,
    // The one mandatory field: a frame without a kind is malformed.
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub member_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
}

impl Envelope {
    #[must_use]
    pub fn request(
        dto_guid: Uuid,
        message_type: MessageType,
        member_name: impl Into<String>,
        parameters: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            message_guid: Uuid::new_v4(),
            dto_guid,
            message_type,
            member_name: member_name.into(),
            parameters,
            response: None,
            error: None,
        }
    }

    #[must_use]
    pub fn root_query() -> Self {
        Self::request(Uuid::nil(), MessageType::RootQuery, "", vec![])
    }

    /// Builds the success response for this request, echoing its correlation
    /// id and target.
    #[must_use]
    pub fn reply(&self, response: serde_json::Value) -> Self {
        Self {
            message_guid: self.message_guid,
            dto_guid: self.dto_guid,
            message_type: self.message_type,
            member_name: self.member_name.clone(),
            parameters: vec![],
            response: Some(response),
            error: None,
        }
    }

    #[must_use]
    pub fn reply_err(&self, error: Error) -> Self {
        Self {
            message_guid: self.message_guid,
            dto_guid: self.dto_guid,
            message_type: self.message_type,
            member_name: self.member_name.clone(),
            parameters: vec![],
            response: None,
            error: Some(error),
        }
    }

    /// Builds a push notification for `dto_guid`'s event `member_name`.
    #[must_use]
    pub fn notification(dto_guid: Uuid, event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_guid: Uuid::new_v4(),
            dto_guid,
            message_type: MessageType::EventNotification,
            member_name: event.into(),
            parameters: vec![],
            response: Some(payload),
            error: None,
        }
    }

    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.message_type == MessageType::EventNotification
    }

    /// # Errors
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))
    }

    /// # Errors
    ///
    /// Fails with `MalformedMessage` when the frame is not a well-formed
    /// envelope.
    pub fn decode(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| Error::new(ErrorKind::MalformedMessage, e.to_string()))
    }

    /// Splits a response envelope into its success payload or the per-request
    /// error the server sent back.
    ///
    /// # Errors
    pub fn into_result(self) -> Result<serde_json::Value> {
        if let Some(error) = self.error {
            Err(error)
        } else {
            Ok(self.response.unwrap_or(serde_json::Value::Null))
        }
    }

    /// Decodes the response payload into the type the call site expects.
    /// The wire carries no type tags; the caller supplies the target type.
    ///
    /// # Errors
    pub fn result_as<T: DeserializeOwned>(self) -> Result<T> {
        let value = self.into_result()?;
        serde_json::from_value(value).map_err(Error::from)
    }

    /// Decodes positional parameter `i`.
    ///
    /// # Errors
    ///
    /// `InvalidArguments` when the parameter is missing or of the wrong shape.
    pub fn param_as<T: DeserializeOwned>(&self, i: usize) -> Result<T> {
        let value = self.parameters.get(i).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidArguments,
                format!("missing parameter {i} for {}", self.member_name),
            )
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| Error::new(ErrorKind::InvalidArguments, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let envelope = Envelope::request(
            Uuid::new_v4(),
            MessageType::Query,
            "GetFiles",
            vec![serde_json::json!(42), serde_json::json!("clip.mov")],
        );
        let frame = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&frame).unwrap(), envelope);

        let reply = envelope.reply(serde_json::json!({"count": 3}));
        let frame = reply.encode().unwrap();
        assert_eq!(Envelope::decode(&frame).unwrap(), reply);

        let failed = envelope.reply_err(Error::kind(ErrorKind::UnknownMember));
        let frame = failed.encode().unwrap();
        assert_eq!(Envelope::decode(&frame).unwrap(), failed);
    }

    #[test]
    fn test_wire_field_names() {
        let envelope = Envelope::root_query();
        let frame = envelope.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert!(value.get("messageGuid").is_some());
        assert_eq!(
            value.get("dtoGuid").unwrap().as_str().unwrap(),
            "00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(value.get("messageType").unwrap(), "RootQuery");
    }

    #[test]
    fn test_decode_failures() {
        assert_eq!(
            Envelope::decode("not json").unwrap_err().kind,
            ErrorKind::MalformedMessage
        );
        assert_eq!(
            Envelope::decode(r#"{"messageType": "Bogus"}"#).unwrap_err().kind,
            ErrorKind::MalformedMessage
        );
        // A frame without a kind is rejected outright.
        assert_eq!(
            Envelope::decode(r#"{"memberName": "Title"}"#).unwrap_err().kind,
            ErrorKind::MalformedMessage
        );
        // Missing fields other than the kind take their defaults.
        let envelope = Envelope::decode(r#"{"messageType": "Get", "memberName": "Title"}"#).unwrap();
        assert_eq!(envelope.message_type, MessageType::Get);
        assert!(envelope.dto_guid.is_nil());
    }

    #[test]
    fn test_typed_extraction() {
        let request = Envelope::request(
            Uuid::new_v4(),
            MessageType::Set,
            "TryCount",
            vec![serde_json::json!(15)],
        );
        assert_eq!(request.param_as::<i32>(0).unwrap(), 15);
        assert_eq!(
            request.param_as::<i32>(1).unwrap_err().kind,
            ErrorKind::InvalidArguments
        );
        assert_eq!(
            request.param_as::<String>(0).unwrap_err().kind,
            ErrorKind::InvalidArguments
        );

        let reply = request.reply(serde_json::json!("copied"));
        assert_eq!(reply.result_as::<String>().unwrap(), "copied");
    }
}
