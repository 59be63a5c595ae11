use bytes::{Bytes, BytesMut};
use std::borrow::Cow;

/// An application payload: data bytes plus optional metadata bytes.
///
/// Both parts are refcounted slices, so cloning a payload or slicing one out of a
///  receive buffer does not copy.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Payload {
    pub data: Bytes,
    pub metadata: Option<Bytes>,
}

impl Payload {
    pub fn new(data: impl Into<Bytes>, metadata: Option<Bytes>) -> Payload {
        Payload {
            data: data.into(),
            metadata,
        }
    }

    pub fn from_data(data: impl Into<Bytes>) -> Payload {
        Payload {
            data: data.into(),
            metadata: None,
        }
    }

    pub fn empty() -> Payload {
        Payload::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.metadata.is_none()
    }

    /// Combined length of data and metadata bytes (without wire length prefixes).
    pub fn len(&self) -> usize {
        self.data.len() + self.metadata.as_ref().map(|m| m.len()).unwrap_or(0)
    }

    pub fn data_utf8(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    pub fn metadata_utf8(&self) -> Option<Cow<'_, str>> {
        self.metadata.as_ref().map(|m| String::from_utf8_lossy(m))
    }
}

/// Splits a payload into fragments of at most `mtu` combined metadata + data bytes,
///  metadata bytes filling fragments before data bytes. The caller marks all but the
///  last fragment with the FOLLOWS flag.
///
/// Returns a single-element vec when the payload fits into `mtu` (or when `mtu` is 0,
///  i.e. fragmentation is disabled).
pub fn split(mtu: usize, payload: Payload) -> Vec<Payload> {
    if mtu == 0 || payload.len() <= mtu {
        return vec![payload];
    }

    let mut metadata = payload.metadata.unwrap_or_default();
    let mut data = payload.data;
    let mut fragments = Vec::new();

    while !metadata.is_empty() || !data.is_empty() {
        let meta_take = metadata.len().min(mtu);
        let frag_meta = metadata.split_to(meta_take);
        let data_take = data.len().min(mtu - meta_take);
        let frag_data = data.split_to(data_take);

        fragments.push(Payload {
            data: frag_data,
            metadata: if meta_take == 0 { None } else { Some(frag_meta) },
        });
    }

    if fragments.is_empty() {
        fragments.push(Payload::empty());
    }
    fragments
}

/// Reassembles a fragmented payload: metadata parts and data parts are concatenated in
///  arrival order.
#[derive(Debug, Default)]
pub struct Reassembler {
    metadata: BytesMut,
    has_metadata: bool,
    data: BytesMut,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler::default()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_metadata && self.data.is_empty()
    }

    /// Accumulated length so far, for enforcing reassembly limits.
    pub fn len(&self) -> usize {
        self.metadata.len() + self.data.len()
    }

    pub fn push(&mut self, fragment: Payload) {
        if let Some(metadata) = fragment.metadata {
            self.has_metadata = true;
            self.metadata.extend_from_slice(&metadata);
        }
        self.data.extend_from_slice(&fragment.data);
    }

    /// Appends the final fragment and yields the reassembled payload, resetting the
    ///  reassembler.
    pub fn finish(&mut self, last: Payload) -> Payload {
        self.push(last);
        let metadata = if self.has_metadata {
            Some(std::mem::take(&mut self.metadata).freeze())
        } else {
            None
        };
        self.has_metadata = false;
        Payload {
            data: std::mem::take(&mut self.data).freeze(),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_small_payload_is_not_split() {
        let payload = Payload::new("hello", Some(Bytes::from_static(b"m")));
        let fragments = split(16, payload.clone());
        assert_eq!(vec![payload], fragments);
    }

    #[test]
    fn test_split_disabled() {
        let payload = Payload::from_data(vec![0u8; 1024]);
        assert_eq!(1, split(0, payload).len());
    }

    #[rstest]
    #[case::data_only(1024, None)]
    #[case::with_metadata(700, Some(500))]
    #[case::metadata_dominant(10, Some(1000))]
    fn test_split_and_reassemble(#[case] data_len: usize, #[case] metadata_len: Option<usize>) {
        let data: Vec<u8> = (0..data_len).map(|i| i as u8).collect();
        let metadata = metadata_len.map(|n| Bytes::from((0..n).map(|i| (i * 7) as u8).collect::<Vec<u8>>()));
        let payload = Payload::new(data, metadata);

        let mtu = 100;
        let mut fragments = split(mtu, payload.clone());
        assert!(fragments.len() > 1);
        for fragment in &fragments {
            assert!(fragment.len() <= mtu);
        }

        let last = fragments.pop().unwrap();
        let mut reassembler = Reassembler::new();
        for fragment in fragments {
            reassembler.push(fragment);
        }
        assert_eq!(payload, reassembler.finish(last));
    }

    #[test]
    fn test_reassembler_resets_after_finish() {
        let mut reassembler = Reassembler::new();
        reassembler.push(Payload::from_data("ab"));
        let first = reassembler.finish(Payload::from_data("cd"));
        assert_eq!(Payload::from_data("abcd"), first);

        assert!(reassembler.is_empty());
        let second = reassembler.finish(Payload::from_data("ef"));
        assert_eq!(Payload::from_data("ef"), second);
    }

    #[test]
    fn test_metadata_parts_concatenate_in_order() {
        let mut reassembler = Reassembler::new();
        reassembler.push(Payload::new("", Some(Bytes::from_static(b"me"))));
        reassembler.push(Payload::new("da", Some(Bytes::from_static(b"ta"))));
        let result = reassembler.finish(Payload::from_data("ta"));
        assert_eq!(Payload::new("data", Some(Bytes::from_static(b"meta"))), result);
    }
}
