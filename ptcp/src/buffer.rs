/// A bounded byte FIFO backing the stream buffers.
///
/// Readable bytes live between the read head and the write head. The
/// region past the write head doubles as staging space: offset writes
/// place bytes there out of order, and [`FifoBuffer::commit`] later
/// advances the write head over them once they become contiguous.
///
/// ```text
/// ...consumed...######readable######...staged / free...
///              ^read head           ^write head
/// ```
#[derive(Debug)]
pub(crate) struct FifoBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    len: usize,
}

impl FifoBuffer {
    pub fn new(capacity: usize) -> FifoBuffer {
        FifoBuffer {
            data: vec![0; capacity].into_boxed_slice(),
            read_pos: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    /// Reads and consumes bytes from the front.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.read_offset(buf, 0);
        self.consume(n);
        n
    }

    /// Reads readable bytes starting `offset` bytes past the read head,
    /// without consuming anything.
    pub fn read_offset(&self, buf: &mut [u8], offset: usize) -> usize {
        let n = buf.len().min(self.len.saturating_sub(offset));
        self.copy_out(&mut buf[..n], self.read_pos + offset);
        n
    }

    /// Drops `n` readable bytes from the front.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        let n = n.min(self.len);
        self.read_pos = (self.read_pos + n) % self.capacity();
        self.len -= n;
    }

    /// Appends readable bytes at the write head.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.write_offset(buf, 0);
        self.commit(n);
        n
    }

    /// Stages bytes `offset` past the write head without making them
    /// readable yet.
    pub fn write_offset(&mut self, buf: &[u8], offset: usize) -> usize {
        let n = buf.len().min(self.remaining().saturating_sub(offset));
        self.copy_in(&buf[..n], self.read_pos + self.len + offset);
        n
    }

    /// Advances the write head over `n` staged bytes, making them readable.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.len = (self.len + n).min(self.capacity());
    }

    /// Replaces the backing storage, retaining readable bytes. Staged bytes
    /// past the write head are discarded.
    pub fn set_capacity(&mut self, capacity: usize) {
        debug_assert!(capacity >= self.len);
        let mut data = vec![0; capacity].into_boxed_slice();
        let n = self.len.min(capacity);
        self.copy_out(&mut data[..n], self.read_pos);
        self.data = data;
        self.read_pos = 0;
        self.len = n;
    }

    fn copy_in(&mut self, src: &[u8], pos: usize) {
        let cap = self.capacity();
        let pos = pos % cap;
        let first = src.len().min(cap - pos);
        self.data[pos..pos + first].copy_from_slice(&src[..first]);
        self.data[..src.len() - first].copy_from_slice(&src[first..]);
    }

    fn copy_out(&self, dst: &mut [u8], pos: usize) {
        let cap = self.capacity();
        let pos = pos % cap;
        let len = dst.len();
        let first = len.min(cap - pos);
        dst[..first].copy_from_slice(&self.data[pos..pos + first]);
        dst[first..].copy_from_slice(&self.data[..len - first]);
    }
}
