use slice_deque::SliceDeque;
use std::cmp::min;
use std::io;

type ByteDeque = SliceDeque<u8>;

/// A dynamically backed, contiguous byte FIFO. Data is appended at the tail and read
/// from the head; `size` is the logical capacity the buffer never grows past.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The logical capacity of the buffer.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Advance the head.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Advance the tail.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    /// Slice containing data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.len() as isize) };
    }

    /// Slice containing free capacity to be written.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        unsafe { self.data.tail_head_slice() }
    }

    /// Write the contents of the buffer to the supplied writer, advancing the read offset.
    #[inline]
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig_len = self.data.len();

        while self.data.len() > 0 {
            let write_count = writer.write(&self.data)?;

            if write_count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.move_head(write_count);
        }

        Ok(orig_len - self.data.len())
    }

    /// Read in data from the supplied reader until the buffer is full.
    #[inline]
    pub fn ingress<R: io::Read>(&mut self, reader: R) -> io::Result<usize> {
        let max = self.free_capacity();
        self.ingress_limited(reader, max)
    }

    /// Read in at most `max` bytes from the supplied reader. Returns the number of bytes
    /// transferred; a short count means the reader hit end of stream. `WouldBlock` is
    /// passed through to the caller with any partial data left in place.
    pub fn ingress_limited<R: io::Read>(&mut self, mut reader: R, max: usize) -> io::Result<usize> {
        if max > self.free_capacity() {
            return Err(io::Error::new(io::ErrorKind::Other, "Buffer overrun"));
        }

        let mut remaining = max;

        while remaining > 0 {
            unsafe {
                let window = min(remaining, self.data.tail_head_slice().len());
                let read_count = reader.read(&mut self.data.tail_head_slice()[..window])?;

                if read_count == 0 {
                    break;
                }

                self.move_tail(read_count);
                remaining -= read_count;
            }
        }

        Ok(max - remaining)
    }

    /// Mutable slice containing data.
    #[allow(dead_code)]
    #[inline]
    pub(crate) fn data_slice(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    pub struct MockChannel {
        pub data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        pub fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        pub fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..512).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 100, mock_data.len());

        let mut buffer = Buffer::new(1024);

        let result = buffer.ingress(&mut channel);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.len(), mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.len(), 0);
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_ingress_limited_stops_at_cap() {
        let mock_data = vec![9u8; 100];
        let mut channel = MockChannel::new(mock_data, 10, 0);

        let mut buffer = Buffer::new(1024);

        let count = buffer.ingress_limited(&mut channel, 2).unwrap();

        assert_eq!(count, 2);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_ingress_limited_reports_short_read() {
        let mut cursor = Cursor::new(vec![1u8, 2, 3]);
        let mut buffer = Buffer::new(1024);

        let count = buffer.ingress_limited(&mut cursor, 10).unwrap();

        assert_eq!(count, 3);
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_ingress_overrun() {
        let mock_data = vec![0u8; 16];
        let mut buffer = Buffer::new(8);

        let result = buffer.ingress_limited(&mock_data[..], 16);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().to_string(), "Buffer overrun");
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_vec = vec![];

        let mut buffer = Buffer::new(1024);
        buffer.write_slice()[0] = 1;
        buffer.move_tail(1);

        let result = buffer.egress(&mut zero_vec[..]);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_no_err() {
        let mut cursor = Cursor::new(vec![1, 2, 3]);
        let mut buffer = Buffer::new(1024);

        buffer.ingress(&mut cursor).unwrap();

        assert_eq!(buffer.read_slice(), &[1, 2, 3]);

        let mut cursor = Cursor::new(Vec::<u8>::new());

        buffer.egress(&mut cursor).unwrap();

        assert!(buffer.is_empty());
        assert_eq!(&cursor.get_ref()[..], &[1, 2, 3]);
    }
}
