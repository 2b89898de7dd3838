use binrw::{binrw, BinRead, BinWrite};
use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::Cursor;
use thiserror::Error;

use crate::{parse_vec, write_vec, LogEntry, LogIndex, NodeId, TermId};

/// Largest frame body a node will accept
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Every frame starts with a big-endian `u32` length of the body
pub const FRAME_HEADER_SIZE: usize = 4;

/// Message discriminant
///
/// Every message starts with one byte: its position in this enumeration.
#[derive(
    TryFromPrimitive, IntoPrimitive, Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Display,
)]
#[repr(u8)]
pub enum MessageKind {
    AppendEntries = 0,
    RequestVote = 1,
    AppendEntriesResponse = 2,
    RequestVoteResponse = 3,
}

/// Sent by the leader to replicate entries; empty `entries` is a heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct AppendEntries {
    pub term: TermId,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    #[br(parse_with = parse_vec)]
    #[bw(write_with = write_vec)]
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct AppendEntriesResponse {
    pub term: TermId,
    #[br(map = |b: u8| b != 0)]
    #[bw(map = |b: &bool| u8::from(*b))]
    pub success: bool,
}

/// Sent by a candidate to gather votes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct RequestVote {
    pub term: TermId,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: TermId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct RequestVoteResponse {
    pub term: TermId,
    #[br(map = |b: u8| b != 0)]
    #[bw(map = |b: &bool| u8::from(*b))]
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub enum Message {
    #[brw(magic(0u8))]
    AppendEntries(AppendEntries),
    #[brw(magic(1u8))]
    RequestVote(RequestVote),
    #[brw(magic(2u8))]
    AppendEntriesResponse(AppendEntriesResponse),
    #[brw(magic(3u8))]
    RequestVoteResponse(RequestVoteResponse),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("trailing bytes in frame: {0}")]
    Trailing(usize),
    #[error("empty frame")]
    Empty,
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),
    #[error("codec: {0}")]
    Codec(#[from] binrw::Error),
}

pub type FrameResult<T> = std::result::Result<T, FrameError>;

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::AppendEntries(_) => MessageKind::AppendEntries,
            Message::RequestVote(_) => MessageKind::RequestVote,
            Message::AppendEntriesResponse(_) => MessageKind::AppendEntriesResponse,
            Message::RequestVoteResponse(_) => MessageKind::RequestVoteResponse,
        }
    }

    /// Encode as a length-prefixed frame, ready to be written to a socket
    pub fn to_frame(&self) -> FrameResult<Vec<u8>> {
        let mut buf = vec![0u8; FRAME_HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf);
        cursor.set_position(4);
        self.write(&mut cursor)?;

        let body_len = buf.len() - FRAME_HEADER_SIZE;
        let header = frame_header(body_len)?;
        buf[..FRAME_HEADER_SIZE].copy_from_slice(&header);
        Ok(buf)
    }

    /// Decode a frame body (everything after the length header)
    pub fn from_frame_body(body: &[u8]) -> FrameResult<Self> {
        let tag = *body.first().ok_or(FrameError::Empty)?;
        let kind = MessageKind::try_from(tag).map_err(|_| FrameError::UnknownKind(tag))?;

        let mut cursor = Cursor::new(body);
        let msg = Message::read(&mut cursor)?;
        let consumed = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
        if consumed != body.len() {
            return Err(FrameError::Trailing(body.len().saturating_sub(consumed)));
        }
        debug_assert_eq!(msg.kind(), kind);
        Ok(msg)
    }
}

/// Body length announced by a frame header
pub fn frame_body_len(header: [u8; FRAME_HEADER_SIZE]) -> FrameResult<usize> {
    let len = usize::try_from(u32::from_be_bytes(header)).unwrap_or(usize::MAX);
    if MAX_FRAME_SIZE < len {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}

fn frame_header(body_len: usize) -> FrameResult<[u8; FRAME_HEADER_SIZE]> {
    if MAX_FRAME_SIZE < body_len {
        return Err(FrameError::TooLarge(body_len));
    }
    let len = u32::try_from(body_len).map_err(|_| FrameError::TooLarge(body_len))?;
    Ok(len.to_be_bytes())
}

impl From<AppendEntries> for Message {
    fn from(m: AppendEntries) -> Self {
        Message::AppendEntries(m)
    }
}

impl From<RequestVote> for Message {
    fn from(m: RequestVote) -> Self {
        Message::RequestVote(m)
    }
}

impl From<AppendEntriesResponse> for Message {
    fn from(m: AppendEntriesResponse) -> Self {
        Message::AppendEntriesResponse(m)
    }
}

impl From<RequestVoteResponse> for Message {
    fn from(m: RequestVoteResponse) -> Self {
        Message::RequestVoteResponse(m)
    }
}
