// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Mapping of requests and responses to table rows.
//!
//! The payload column starts with the big-endian serial version the payload was written with.
//! Responses continue with their kind, group size and lead flag. The remaining bytes belong to
//! the message body which is encoded by the owning service.

use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::{DeserializeOwned, Error as DeserializationError};
use serde::ser::Error as SerializationError;

use agentmsg_table_store::Row;
use agentmsg_types::SerialVersion;
use agentmsg_types::errors::{ConversionError, GenericError};

use crate::message::{
    MessageHeader, MessageTable, Request, RequestId, Response, ResponseKind, ServiceType,
};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encoding failed: {0}")]
    Encode(GenericError),
    #[error("decoding failed: {0}")]
    Decode(GenericError),
    #[error("insufficient data reading {field}: {remaining} bytes remaining")]
    Truncated {
        field: &'static str,
        remaining: usize,
    },
    #[error("payload serial version {found} is not supported, maximum supported is {max}")]
    UnsupportedSerialVersion {
        found: SerialVersion,
        max: SerialVersion,
    },
    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

/// Body of a request or response. Implementations own the encoding of their payload and need to
/// decode every serial version up to the maximum version of their service.
pub trait MessageBody: Sized + Send + Sync + 'static {
    fn encode<B: BufMut>(
        &self,
        serial_version: SerialVersion,
        buf: &mut B,
    ) -> Result<(), CodecError>;

    fn decode<B: Buf>(buf: &mut B, serial_version: SerialVersion) -> Result<Self, CodecError>;
}

/// Body of a response which several agents contribute to.
pub trait ResponseBody: MessageBody + Clone {
    /// Incorporates the contribution of `other`. Only called for responses of equal group size.
    fn merge(&mut self, other: Self);
}

/// A message which is persisted as one row of a [`MessageTable`].
pub trait StoredMessage: Sized + Send + 'static {
    const TABLE: MessageTable;

    fn header(&self) -> &MessageHeader;

    fn to_row(&self, serial_version: SerialVersion) -> Result<Row, CodecError>;

    fn from_row(row: &Row, max_serial_version: SerialVersion) -> Result<Self, CodecError>;

    fn request_id(&self) -> RequestId {
        self.header().request_id()
    }
}

impl<B: MessageBody> StoredMessage for Request<B> {
    const TABLE: MessageTable = MessageTable::Requests;

    fn header(&self) -> &MessageHeader {
        Request::header(self)
    }

    fn to_row(&self, serial_version: SerialVersion) -> Result<Row, CodecError> {
        let mut buf = BytesMut::new();
        buf.put_u16(serial_version.as_u16());
        self.body().encode(serial_version, &mut buf)?;
        Ok(new_row(self.header(), buf.freeze()))
    }

    fn from_row(row: &Row, max_serial_version: SerialVersion) -> Result<Self, CodecError> {
        let header = header_from_row(row)?;
        let mut payload = row.payload.clone();
        let serial_version = read_serial_version(&mut payload, max_serial_version)?;
        let body = B::decode(&mut payload, serial_version)?;
        Ok(Request::from_parts(header, body))
    }
}

impl<B: ResponseBody> StoredMessage for Response<B> {
    const TABLE: MessageTable = MessageTable::Responses;

    fn header(&self) -> &MessageHeader {
        Response::header(self)
    }

    fn to_row(&self, serial_version: SerialVersion) -> Result<Row, CodecError> {
        let mut buf = BytesMut::new();
        buf.put_u16(serial_version.as_u16());
        buf.put_u8(self.kind() as u8);
        buf.put_u32(self.group_size());
        buf.put_u8(u8::from(self.has_response_from_lead()));
        self.body().encode(serial_version, &mut buf)?;
        Ok(new_row(self.header(), buf.freeze()))
    }

    fn from_row(row: &Row, max_serial_version: SerialVersion) -> Result<Self, CodecError> {
        let header = header_from_row(row)?;
        let mut payload = row.payload.clone();
        let serial_version = read_serial_version(&mut payload, max_serial_version)?;

        ensure_remaining(
            &payload,
            "response envelope",
            2 * mem::size_of::<u8>() + mem::size_of::<u32>(),
        )?;
        let kind = ResponseKind::try_from(payload.get_u8())?;
        let group_size = payload.get_u32();
        let has_response_from_lead = match payload.get_u8() {
            0 => false,
            1 => true,
            _ => return Err(ConversionError::invalid_data("has_response_from_lead").into()),
        };

        let body = B::decode(&mut payload, serial_version)?;
        Ok(Response::from_parts(
            header,
            kind,
            group_size,
            has_response_from_lead,
            body,
        ))
    }
}

fn new_row(header: &MessageHeader, payload: Bytes) -> Row {
    Row {
        request_id: header.request_id(),
        service_type: header.service_type().ordinal(),
        timestamp: header.timestamp(),
        payload,
    }
}

fn header_from_row(row: &Row) -> Result<MessageHeader, CodecError> {
    let service_type = ServiceType::try_from(row.service_type)?;
    Ok(MessageHeader::with_timestamp(
        service_type,
        row.request_id,
        row.timestamp,
    ))
}

fn ensure_remaining<B: Buf>(
    buf: &B,
    field: &'static str,
    required: usize,
) -> Result<(), CodecError> {
    if buf.remaining() < required {
        return Err(CodecError::Truncated {
            field,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn read_serial_version<B: Buf>(
    buf: &mut B,
    max_serial_version: SerialVersion,
) -> Result<SerialVersion, CodecError> {
    ensure_remaining(buf, "serial version", mem::size_of::<u16>())?;
    let serial_version = SerialVersion::new(buf.get_u16());
    if !serial_version.is_readable_by(max_serial_version) {
        return Err(CodecError::UnsupportedSerialVersion {
            found: serial_version,
            max: max_serial_version,
        });
    }
    Ok(serial_version)
}

/// Implements [`MessageBody`] by encoding the implementing type as length-prefixed
/// [`flexbuffers`] using [`serde`]. The serial version is ignored, so the type has to stay
/// serde-compatible across versions.
#[macro_export]
macro_rules! flexbuffers_message_body {
    ($name:ty) => {
        impl $crate::codec::MessageBody for $name {
            fn encode<B: ::bytes::BufMut>(
                &self,
                _serial_version: $crate::SerialVersion,
                buf: &mut B,
            ) -> Result<(), $crate::codec::CodecError> {
                $crate::codec::encode_as_flexbuffers(self, buf)
                    .map_err(|err| $crate::codec::CodecError::Encode(err.into()))
            }

            fn decode<B: ::bytes::Buf>(
                buf: &mut B,
                _serial_version: $crate::SerialVersion,
            ) -> Result<Self, $crate::codec::CodecError> {
                $crate::codec::decode_from_flexbuffers(buf)
                    .map_err(|err| $crate::codec::CodecError::Decode(err.into()))
            }
        }
    };
}

/// Utility method to encode a [`Serialize`] type as flexbuffers using serde.
pub fn encode_as_flexbuffers<T: Serialize, B: BufMut>(
    value: T,
    buf: &mut B,
) -> Result<(), flexbuffers::SerializationError> {
    let vec = flexbuffers::to_vec(value)?;

    let required_buffer_bytes = vec.len() + mem::size_of::<u32>();
    if buf.remaining_mut() < required_buffer_bytes {
        return Err(flexbuffers::SerializationError::custom(format!(
            "not enough buffer space to serialize value; required {} bytes but free capacity was {}",
            required_buffer_bytes,
            buf.remaining_mut()
        )));
    }

    buf.put_u32_le(u32::try_from(vec.len()).map_err(|_| {
        flexbuffers::SerializationError::custom("only support serializing types of size <= 4GB")
    })?);
    buf.put(&vec[..]);
    Ok(())
}

/// Utility method to decode a [`DeserializeOwned`] type from flexbuffers using serde.
pub fn decode_from_flexbuffers<T: DeserializeOwned, B: Buf>(
    buf: &mut B,
) -> Result<T, flexbuffers::DeserializationError> {
    if buf.remaining() < mem::size_of::<u32>() {
        return Err(flexbuffers::DeserializationError::custom(format!(
            "insufficient data: expecting {} bytes for length",
            mem::size_of::<u32>()
        )));
    }
    let length = usize::try_from(buf.get_u32_le()).map_err(|_| {
        flexbuffers::DeserializationError::custom("flexbuffers length does not fit into usize")
    })?;

    if buf.remaining() < length {
        return Err(flexbuffers::DeserializationError::custom(format!(
            "insufficient data: expecting {length} bytes for flexbuffers"
        )));
    }

    // flexbuffers locates the root at the end of the slice, so it must end exactly at `length`
    let bytes = buf.copy_to_bytes(length);
    flexbuffers::from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Deserialize;

    use agentmsg_types::time::MillisSinceEpoch;

    use super::*;
    use crate::message::VERSION_REQUEST_ID;

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Progress {
        applied_up_to: BTreeMap<String, u64>,
    }

    crate::flexbuffers_message_body!(Progress);

    impl ResponseBody for Progress {
        fn merge(&mut self, other: Self) {
            for (region, position) in other.applied_up_to {
                let entry = self.applied_up_to.entry(region).or_default();
                *entry = (*entry).max(position);
            }
        }
    }

    fn progress(entries: &[(&str, u64)]) -> Progress {
        Progress {
            applied_up_to: entries
                .iter()
                .map(|(region, position)| (region.to_string(), *position))
                .collect(),
        }
    }

    #[test]
    fn response_row_layout() {
        let response = Response::group_agent_version(
            ServiceType::PointInTimeRecovery,
            4,
            progress(&[("eu-west", 7)]),
        )
        .from_lead();

        let row = response.to_row(SerialVersion::new(2)).unwrap();
        assert_eq!(row.request_id, VERSION_REQUEST_ID);
        assert_eq!(row.service_type, 1);
        assert_eq!(row.timestamp, response.timestamp());
        // serial version, kind, group size, lead flag
        assert_eq!(&row.payload[..8], &[0, 2, 1, 0, 0, 0, 4, 1]);

        let decoded = Response::<Progress>::from_row(&row, SerialVersion::new(2)).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn request_from_row_keeps_row_columns() {
        let request = Request::from_parts(
            MessageHeader::with_timestamp(
                ServiceType::MultiRegionTable,
                12,
                MillisSinceEpoch::new(1_700_000_000_000),
            ),
            progress(&[("us-east", 1)]),
        );

        let row = request.to_row(SerialVersion::MIN).unwrap();
        let decoded = Request::<Progress>::from_row(&row, SerialVersion::MIN).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn newer_serial_versions_are_rejected() {
        let request = Request::new(ServiceType::MultiRegionTable, 1, Progress::default());
        let row = request.to_row(SerialVersion::new(3)).unwrap();

        let err = Request::<Progress>::from_row(&row, SerialVersion::new(2)).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnsupportedSerialVersion { found, max }
                if found == SerialVersion::new(3) && max == SerialVersion::new(2)
        ));
    }

    #[test]
    fn corrupt_rows_fail_to_decode() {
        let response = Response::new(ServiceType::MultiRegionTable, 3, 2, Progress::default());
        let mut row = response.to_row(SerialVersion::MIN).unwrap();

        let mut truncated = row.clone();
        truncated.payload = row.payload.slice(..4);
        assert!(matches!(
            Response::<Progress>::from_row(&truncated, SerialVersion::MIN),
            Err(CodecError::Truncated { .. })
        ));

        row.service_type = 42;
        assert!(matches!(
            Response::<Progress>::from_row(&row, SerialVersion::MIN),
            Err(CodecError::Conversion(_))
        ));
    }

    #[test]
    fn merge_semantics_are_owned_by_the_body() {
        let mut stored = progress(&[("eu-west", 7), ("us-east", 3)]);
        stored.merge(progress(&[("eu-west", 5), ("ap-south", 1)]));
        assert_eq!(
            stored,
            progress(&[("ap-south", 1), ("eu-west", 7), ("us-east", 3)])
        );
    }
}
