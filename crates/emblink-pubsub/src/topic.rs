//! Topic path parsing and canonicalization.
//!
//! A path is `/`-separated segments, each truncated to [`MAX_SEGMENT_LEN`]
//! bytes and the whole path to [`MAX_TOPIC_LEN`] bytes -- a deliberate
//! design choice to keep every topic node's name field a fixed, tiny array
//! rather than a heap string. [`TopicPath::parse`] performs the truncation
//! once at the edge so the rest of the tree walk never has to think about
//! oversized segments again.

pub const MAX_TOPIC_LEN: usize = 31;
pub const MAX_SEGMENT_LEN: usize = 7;

#[derive(Clone, Copy)]
pub struct TopicPath {
    buf: [u8; MAX_TOPIC_LEN],
    len: u8,
    truncated: bool,
}

impl TopicPath {
    pub fn parse(path: &str) -> Self {
        let mut buf = [0u8; MAX_TOPIC_LEN];
        let mut len = 0usize;
        let mut truncated = false;
        let mut first = true;

        for seg in path.split('/') {
            if seg.is_empty() {
                continue;
            }
            let bytes = seg.as_bytes();
            let seg_len = if bytes.len() > MAX_SEGMENT_LEN {
                truncated = true;
                MAX_SEGMENT_LEN
            } else {
                bytes.len()
            };
            let sep = if first { 0 } else { 1 };
            if len + sep + seg_len > MAX_TOPIC_LEN {
                truncated = true;
                break;
            }
            if !first {
                buf[len] = b'/';
                len += 1;
            }
            buf[len..len + seg_len].copy_from_slice(&bytes[..seg_len]);
            len += seg_len;
            first = false;
        }

        TopicPath { buf, len: len as u8, truncated }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
    }

    /// Whether parsing had to drop or shorten any segment to fit the limits.
    #[inline]
    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.as_str().split('/').filter(|s| !s.is_empty()).map(str::as_bytes)
    }

    /// A metadata topic is one whose last segment is the literal `$`.
    pub fn is_meta(&self) -> bool {
        self.as_str().rsplit('/').next() == Some("$")
    }

    /// The non-`$` sibling path a metadata topic addresses, or `None` if
    /// this path is not a metadata topic.
    pub fn meta_target(&self) -> Option<TopicPath> {
        if !self.is_meta() {
            return None;
        }
        let s = self.as_str();
        let trimmed = s.strip_suffix('$').unwrap_or(s).trim_end_matches('/');
        Some(TopicPath::parse(trimmed))
    }
}
