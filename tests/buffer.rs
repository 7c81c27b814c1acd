use fluxmux::GrowableBuffer;
use std::io::{self, Cursor, Write};

#[test]
fn test_grows_to_next_page_multiple() {
    let mut buf = GrowableBuffer::with_page_size(8, 16).unwrap();
    buf.enqueue(b"hello").unwrap();
    assert_eq!(buf.capacity(), 8);

    buf.enqueue(b"world").unwrap();
    // (8 + 5 + 16) / 16 * 16
    assert_eq!(buf.capacity(), 16);
    assert_eq!(buf.as_slice(), b"helloworld");
    assert_eq!(buf.remaining(), 6);
}

#[test]
fn test_failed_growth_leaves_buffer_untouched() {
    let mut buf = GrowableBuffer::with_page_size(4, usize::MAX).unwrap();
    buf.enqueue(b"abc").unwrap();

    let err = buf.enqueue(b"defgh").unwrap_err();
    assert!(matches!(err, fluxmux::Error::Allocation(_)));
    assert_eq!(buf.as_slice(), b"abc");
    assert_eq!(buf.capacity(), 4);
}

#[test]
fn test_enqueue_parts_is_contiguous() {
    let mut buf = GrowableBuffer::with_page_size(4, 4).unwrap();
    buf.enqueue_parts(&[b"head", b"er", b"payload"]).unwrap();
    assert_eq!(buf.as_slice(), b"headerpayload");
    assert!(buf.capacity() >= 13);
    assert_eq!(buf.capacity() % 4, 0);
}

#[test]
fn test_consume_shifts_to_front() {
    let mut buf = GrowableBuffer::new(64).unwrap();
    buf.enqueue(b"0123456789").unwrap();
    buf.consume(4);
    assert_eq!(buf.as_slice(), b"456789");
    buf.consume(100);
    assert!(buf.is_empty());
    assert_eq!(buf.capacity(), 64);
}

#[test]
fn test_fill_from_never_grows() {
    let mut buf = GrowableBuffer::with_page_size(4, 4).unwrap();
    let mut source = Cursor::new(b"abcdefgh".to_vec());

    assert_eq!(buf.fill_from(&mut source, 3).unwrap(), 3);
    assert_eq!(buf.fill_from(&mut source, usize::MAX).unwrap(), 1);
    assert_eq!(buf.as_slice(), b"abcd");

    // Full: nothing is read.
    assert_eq!(buf.fill_from(&mut source, usize::MAX).unwrap(), 0);
    assert_eq!(source.position(), 4);
    assert_eq!(buf.capacity(), 4);
}

struct Trickle {
    written: Vec<u8>,
    step: usize,
}

impl Write for Trickle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.step);
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_drain_into_keeps_unsent_remainder() {
    let mut buf = GrowableBuffer::new(32).unwrap();
    buf.enqueue(b"abcdef").unwrap();
    let mut sink = Trickle {
        written: Vec::new(),
        step: 4,
    };

    assert_eq!(buf.drain_into(&mut sink).unwrap(), 4);
    assert_eq!(buf.as_slice(), b"ef");
    assert_eq!(buf.drain_into(&mut sink).unwrap(), 2);
    assert!(buf.is_empty());
    assert_eq!(buf.drain_into(&mut sink).unwrap(), 0);
    assert_eq!(sink.written, b"abcdef");
}
