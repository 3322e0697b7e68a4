//! Scripted transport for unit tests.
use std::collections::VecDeque;
use std::time::Duration;

use super::Transport;
use crate::error::{Error, Result};

pub(crate) enum Reply {
    /// Bytes handed out as they are
    Bytes(Vec<u8>),
    /// Frame whose first two bytes are replaced by those of the last sent frame
    Echo(Vec<u8>),
    /// Nothing arrives before the timeout
    Silence,
    Fail(Error),
}

#[derive(Default)]
pub(crate) struct MockTransport {
    pub sent: Vec<Vec<u8>>,
    pub replies: VecDeque<Reply>,
    pub lost: bool,
    /// Caps the number of bytes accepted per `send_frame`
    pub accept_limit: Option<usize>,
}

impl MockTransport {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        MockTransport {
            replies: replies.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Sent frames concatenated, for stream protocols.
    pub fn sent_bytes(&self) -> Vec<u8> {
        self.sent.concat()
    }
}

impl Transport for MockTransport {
    fn send_frame(&mut self, raw: &[u8], _timeout: Duration) -> Result<usize> {
        self.sent.push(raw.to_vec());
        Ok(self.accept_limit.map_or(raw.len(), |n| n.min(raw.len())))
    }

    fn recv_frame(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let data = match self.replies.pop_front() {
            Some(Reply::Bytes(data)) => data,
            Some(Reply::Echo(mut data)) => {
                if let Some(last) = self.sent.last() {
                    data[..2].copy_from_slice(&last[..2]);
                }
                data
            }
            Some(Reply::Silence) | None => return Ok(0),
            Some(Reply::Fail(e)) => return Err(e),
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn device_lost(&mut self) {
        self.lost = true;
    }
}
