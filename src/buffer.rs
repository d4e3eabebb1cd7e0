//! Owned byte buffer for record payloads and read results
//!
//! Record payloads are opaque bytes, but the common case is logging short
//! text events, so [`DataBuffer`] also offers a NUL-terminated-string view.

use std::ffi::CStr;

/// Owned, copy-on-assign byte container.
///
/// A buffer is either *allocated* (holding zero or more bytes) or
/// *unallocated*. Equality between buffers is false whenever either side is
/// unallocated, so a failed read never compares equal to anything.
#[derive(Debug, Clone, Default)]
pub struct DataBuffer {
    data: Option<Vec<u8>>,
}

impl DataBuffer {
    /// Create an unallocated buffer.
    pub fn new() -> Self {
        DataBuffer { data: None }
    }

    /// Copy `bytes` into a new allocated buffer.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        DataBuffer {
            data: Some(bytes.to_vec()),
        }
    }

    /// Copy a string into a new buffer, including a trailing NUL.
    pub fn from_str(s: &str) -> Self {
        let mut data = Vec::with_capacity(s.len() + 1);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
        DataBuffer { data: Some(data) }
    }

    /// Copy a C string into a new buffer, including the trailing NUL.
    pub fn from_cstr(s: &CStr) -> Self {
        DataBuffer {
            data: Some(s.to_bytes_with_nul().to_vec()),
        }
    }

    /// True once the buffer holds storage (possibly zero bytes).
    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    /// Resize to `len` zeroed bytes and return the mutable storage.
    ///
    /// Any previous contents are discarded.
    pub fn allocate(&mut self, len: usize) -> &mut [u8] {
        self.data.insert(vec![0; len]).as_mut_slice()
    }

    /// Shorten the buffer to `new_len` bytes. No effect if the buffer is
    /// unallocated or already shorter.
    pub fn truncate(&mut self, new_len: usize) {
        if let Some(data) = self.data.as_mut() {
            data.truncate(new_len);
        }
    }

    /// Number of bytes held; 0 when unallocated.
    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte view; empty when unallocated.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// C-string view.
    ///
    /// Returns the empty string when the buffer is unallocated or its
    /// contents are not a single NUL-terminated string.
    pub fn as_cstr(&self) -> &CStr {
        self.data
            .as_deref()
            .and_then(|d| CStr::from_bytes_with_nul(d).ok())
            .unwrap_or(c"")
    }

    /// UTF-8 view of [`as_cstr`](Self::as_cstr), lossy on invalid bytes.
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        self.as_cstr().to_string_lossy()
    }
}

impl PartialEq for DataBuffer {
    fn eq(&self, other: &Self) -> bool {
        match (&self.data, &other.data) {
            (Some(a), Some(b)) => a == b,
            // An unallocated buffer equals nothing, itself included.
            _ => false,
        }
    }
}

impl From<&[u8]> for DataBuffer {
    fn from(bytes: &[u8]) -> Self {
        DataBuffer::from_bytes(bytes)
    }
}

impl From<&str> for DataBuffer {
    fn from(s: &str) -> Self {
        DataBuffer::from_str(s)
    }
}
