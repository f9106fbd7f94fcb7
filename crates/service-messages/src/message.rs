// Copyright (c) 2024 - Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use agentmsg_types::errors::ConversionError;
use agentmsg_types::time::MillisSinceEpoch;

use crate::codec::ResponseBody;

/// Identifier correlating a request with its response.
///
/// [`UNUSED_REQUEST_ID`] is never used. Positive ids are enumerated by message iterators, negative ids are only
/// reachable by direct lookup.
pub type RequestId = i64;

/// Never assigned to a message; posting it is rejected.
pub const UNUSED_REQUEST_ID: RequestId = 0;

/// Reserved id of the per service type singleton response which carries the group agent version.
pub const VERSION_REQUEST_ID: RequestId = -1;

/// First request id returned by message iterators when no start id is given.
pub const DEFAULT_START_REQUEST_ID: RequestId = 1;

/// Distributed service owning a partition of the message key space.
///
/// # Important
/// The ordinal is part of every persisted row and primary key. New services must be appended at
/// the end; existing members must never be reordered or removed.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::FromRepr,
    strum::EnumIter,
    strum::Display,
    strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum ServiceType {
    /// Multi-region table synchronization agents.
    #[strum(serialize = "multi-region-table")]
    MultiRegionTable = 0,
    /// Point-in-time recovery agents.
    #[strum(serialize = "point-in-time-recovery")]
    PointInTimeRecovery = 1,
}

impl ServiceType {
    pub const fn ordinal(self) -> u8 {
        self as u8
    }
}

impl From<ServiceType> for u8 {
    fn from(value: ServiceType) -> Self {
        value.ordinal()
    }
}

impl TryFrom<u8> for ServiceType {
    type Error = ConversionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ServiceType::from_repr(value)
            .ok_or_else(|| ConversionError::unknown_discriminant("service_type", value))
    }
}

/// The two tables messages are stored in. Both are shared by all service types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum MessageTable {
    #[strum(serialize = "requests")]
    Requests,
    #[strum(serialize = "responses")]
    Responses,
}

impl MessageTable {
    pub const REQUEST_TABLE_NAME: &'static str = "sys$service_requests";
    pub const RESPONSE_TABLE_NAME: &'static str = "sys$service_responses";

    /// Name of the backing table in the table store.
    pub const fn table_name(self) -> &'static str {
        match self {
            MessageTable::Requests => Self::REQUEST_TABLE_NAME,
            MessageTable::Responses => Self::RESPONSE_TABLE_NAME,
        }
    }
}

/// Envelope fields shared by requests and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    service_type: ServiceType,
    request_id: RequestId,
    /// Informational only, never used for ordering.
    timestamp: MillisSinceEpoch,
}

impl MessageHeader {
    pub fn new(service_type: ServiceType, request_id: RequestId) -> Self {
        Self::with_timestamp(service_type, request_id, MillisSinceEpoch::now())
    }

    pub fn with_timestamp(
        service_type: ServiceType,
        request_id: RequestId,
        timestamp: MillisSinceEpoch,
    ) -> Self {
        Self {
            service_type,
            request_id,
            timestamp,
        }
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn timestamp(&self) -> MillisSinceEpoch {
        self.timestamp
    }
}

/// A message written by exactly one agent per request id.
#[derive(Debug, Clone, PartialEq)]
pub struct Request<B> {
    header: MessageHeader,
    body: B,
}

impl<B> Request<B> {
    pub fn new(service_type: ServiceType, request_id: RequestId, body: B) -> Self {
        Self::from_parts(MessageHeader::new(service_type, request_id), body)
    }

    pub fn from_parts(header: MessageHeader, body: B) -> Self {
        Self { header, body }
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn service_type(&self) -> ServiceType {
        self.header.service_type
    }

    pub fn request_id(&self) -> RequestId {
        self.header.request_id
    }

    pub fn timestamp(&self) -> MillisSinceEpoch {
        self.header.timestamp
    }

    pub fn body(&self) -> &B {
        &self.body
    }

    pub fn into_body(self) -> B {
        self.body
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::FromRepr, strum::Display,
)]
#[repr(u8)]
pub enum ResponseKind {
    #[default]
    #[strum(serialize = "ordinary")]
    Ordinary = 0,
    /// Compatibility version claimed by the group's agents, stored at [`VERSION_REQUEST_ID`].
    #[strum(serialize = "group-agent-version")]
    GroupAgentVersion = 1,
}

impl TryFrom<u8> for ResponseKind {
    type Error = ConversionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ResponseKind::from_repr(value)
            .ok_or_else(|| ConversionError::unknown_discriminant("response_kind", value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("cannot merge responses of group size {stored} and {incoming}")]
    GroupSizeMismatch { stored: u32, incoming: u32 },
    #[error("cannot merge response for {incoming_type}/{incoming_id} into {stored_type}/{stored_id}")]
    KeyMismatch {
        stored_type: ServiceType,
        stored_id: RequestId,
        incoming_type: ServiceType,
        incoming_id: RequestId,
    },
}

/// A message which may be assembled from the contributions of several agents of a group.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<B> {
    header: MessageHeader,
    kind: ResponseKind,
    /// The writer's view of the number of group members.
    group_size: u32,
    has_response_from_lead: bool,
    body: B,
}

impl<B> Response<B> {
    pub fn new(service_type: ServiceType, request_id: RequestId, group_size: u32, body: B) -> Self {
        Self::from_parts(
            MessageHeader::new(service_type, request_id),
            ResponseKind::Ordinary,
            group_size,
            false,
            body,
        )
    }

    /// Creates the group agent version response of `service_type`.
    pub fn group_agent_version(service_type: ServiceType, group_size: u32, body: B) -> Self {
        Self::from_parts(
            MessageHeader::new(service_type, VERSION_REQUEST_ID),
            ResponseKind::GroupAgentVersion,
            group_size,
            false,
            body,
        )
    }

    pub fn from_parts(
        header: MessageHeader,
        kind: ResponseKind,
        group_size: u32,
        has_response_from_lead: bool,
        body: B,
    ) -> Self {
        Self {
            header,
            kind,
            group_size,
            has_response_from_lead,
            body,
        }
    }

    /// Marks this response as written by the lead agent of its group.
    pub fn from_lead(mut self) -> Self {
        self.has_response_from_lead = true;
        self
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn service_type(&self) -> ServiceType {
        self.header.service_type
    }

    pub fn request_id(&self) -> RequestId {
        self.header.request_id
    }

    pub fn timestamp(&self) -> MillisSinceEpoch {
        self.header.timestamp
    }

    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    pub fn group_size(&self) -> u32 {
        self.group_size
    }

    pub fn has_response_from_lead(&self) -> bool {
        self.has_response_from_lead
    }

    pub fn body(&self) -> &B {
        &self.body
    }

    pub fn into_body(self) -> B {
        self.body
    }

    /// Whether posting this response overwrites the stored one without reading it first.
    pub fn is_lead_version_claim(&self) -> bool {
        self.kind == ResponseKind::GroupAgentVersion && self.has_response_from_lead
    }
}

impl<B: ResponseBody> Response<B> {
    /// Incorporates the contribution of `other` into this response.
    ///
    /// Both responses need to address the same key and report the same group size.
    pub fn merge(&mut self, other: Response<B>) -> Result<(), MergeError> {
        if self.header.service_type != other.header.service_type
            || self.header.request_id != other.header.request_id
        {
            return Err(MergeError::KeyMismatch {
                stored_type: self.header.service_type,
                stored_id: self.header.request_id,
                incoming_type: other.header.service_type,
                incoming_id: other.header.request_id,
            });
        }
        if self.group_size != other.group_size {
            return Err(MergeError::GroupSizeMismatch {
                stored: self.group_size,
                incoming: other.group_size,
            });
        }

        self.has_response_from_lead |= other.has_response_from_lead;
        self.header.timestamp = MillisSinceEpoch::now();
        self.body.merge(other.body);
        Ok(())
    }
}

/// A message handed to the posting algorithm of the service manager.
#[derive(Debug)]
pub enum ServiceMessage<'a, Q, R> {
    Request(&'a Request<Q>),
    Response(&'a Response<R>),
}

impl<Q, R> Clone for ServiceMessage<'_, Q, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Q, R> Copy for ServiceMessage<'_, Q, R> {}

impl<Q, R> ServiceMessage<'_, Q, R> {
    pub fn table(&self) -> MessageTable {
        match self {
            ServiceMessage::Request(_) => MessageTable::Requests,
            ServiceMessage::Response(_) => MessageTable::Responses,
        }
    }

    pub fn header(&self) -> &MessageHeader {
        match self {
            ServiceMessage::Request(request) => request.header(),
            ServiceMessage::Response(response) => response.header(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde::{Deserialize, Serialize};
    use strum::IntoEnumIterator;

    use super::*;
    use crate::flexbuffers_message_body;

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Acks(BTreeSet<u32>);

    flexbuffers_message_body!(Acks);

    impl ResponseBody for Acks {
        fn merge(&mut self, other: Self) {
            self.0.extend(other.0);
        }
    }

    fn acks(members: &[u32]) -> Acks {
        Acks(members.iter().copied().collect())
    }

    #[test]
    fn service_type_ordinals_are_stable() {
        let ordinals = ServiceType::iter()
            .map(|t| (t.ordinal(), t.to_string()))
            .collect::<Vec<_>>();
        assert_eq!(
            ordinals,
            vec![
                (0, "multi-region-table".to_owned()),
                (1, "point-in-time-recovery".to_owned())
            ]
        );
        assert!(ServiceType::try_from(2).is_err());
    }

    #[test]
    fn merge_combines_contributions() {
        let mut stored = Response::new(ServiceType::MultiRegionTable, 5, 3, acks(&[1]));
        let incoming = Response::new(ServiceType::MultiRegionTable, 5, 3, acks(&[2])).from_lead();

        stored.merge(incoming).unwrap();

        assert_eq!(stored.body(), &acks(&[1, 2]));
        assert!(stored.has_response_from_lead());
        assert_eq!(stored.kind(), ResponseKind::Ordinary);
    }

    #[test]
    fn merge_requires_equal_group_size() {
        let mut stored = Response::new(ServiceType::MultiRegionTable, 5, 3, acks(&[1]));
        let incoming = Response::new(ServiceType::MultiRegionTable, 5, 2, acks(&[2]));

        assert_eq!(
            stored.merge(incoming),
            Err(MergeError::GroupSizeMismatch {
                stored: 3,
                incoming: 2
            })
        );
        assert_eq!(stored.body(), &acks(&[1]));
    }

    #[test]
    fn merge_requires_same_key() {
        let mut stored = Response::new(ServiceType::MultiRegionTable, 5, 3, acks(&[1]));
        let incoming = Response::new(ServiceType::PointInTimeRecovery, 5, 3, acks(&[2]));

        assert!(matches!(
            stored.merge(incoming),
            Err(MergeError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn lead_version_claims() {
        let version = Response::group_agent_version(ServiceType::PointInTimeRecovery, 3, acks(&[]));
        assert_eq!(version.request_id(), VERSION_REQUEST_ID);
        assert!(!version.is_lead_version_claim());
        assert!(version.from_lead().is_lead_version_claim());

        let ordinary = Response::new(ServiceType::PointInTimeRecovery, 1, 3, acks(&[])).from_lead();
        assert!(!ordinary.is_lead_version_claim());
    }
}
