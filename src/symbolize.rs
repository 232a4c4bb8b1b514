//! Call-stack capture and frame resolution for stack counters.
//!
//! Capturing and resolving are deliberately split. [`capture`] only records
//! raw code addresses into a fixed-size [`StackKey`] on the caller's stack,
//! which is cheap and allocation-free, and is done on every increment.
//! Resolving addresses to `function:line` pairs through a [`Symbolize`]
//! implementation is expensive and happens once per distinct stack.
//!
//! ```text
//!   inc() ──► capture() ──► StackKey [ip0, ip1, ...]   (every call)
//!                                │
//!                                ▼ first time only
//!                      Symbolize::locate(frame) ──► FrameLocation
//! ```

use std::ffi::c_void;
use std::fmt::Debug;

use parking_lot::Mutex;
use tracing::debug;

/// Upper bound on the depth of a stack counter.
pub const MAX_STACK_DEPTH: usize = 32;

/// A raw stack frame: the return address and the start of its function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Frame {
    /// Instruction pointer (return address) of the frame.
    pub ip: usize,
    /// Address of the first instruction of the enclosing function, or 0 if unknown.
    pub entry: usize,
}

/// An ordered sequence of at most [`MAX_STACK_DEPTH`] frames.
///
/// Two keys are equal iff they have the same length and pointwise-equal
/// instruction pointers. The storage lives inline so that capturing a key
/// never allocates.
#[derive(Clone, Copy)]
pub struct StackKey {
    frames: [Frame; MAX_STACK_DEPTH],
    len: usize,
}

impl StackKey {
    /// An empty key, the identity of every zero-depth stack counter.
    pub const fn empty() -> Self {
        Self {
            frames: [Frame { ip: 0, entry: 0 }; MAX_STACK_DEPTH],
            len: 0,
        }
    }

    /// Builds a key from explicit frames, keeping at most [`MAX_STACK_DEPTH`] of them.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use conteggi::symbolize::{Frame, StackKey};
    ///
    /// let key = StackKey::from_frames(&[Frame { ip: 0x10, entry: 0x08 }]);
    /// assert_eq!(key.len(), 1);
    /// ```
    pub fn from_frames(frames: &[Frame]) -> Self {
        let mut key = Self::empty();
        for frame in frames.iter().take(MAX_STACK_DEPTH) {
            key.push(*frame);
        }
        key
    }

    /// Builds a key from instruction pointers alone.
    pub fn from_ips(ips: &[usize]) -> Self {
        let mut key = Self::empty();
        for ip in ips.iter().take(MAX_STACK_DEPTH) {
            key.push(Frame { ip: *ip, entry: 0 });
        }
        key
    }

    #[inline]
    fn push(&mut self, frame: Frame) {
        if self.len < MAX_STACK_DEPTH {
            self.frames[self.len] = frame;
            self.len += 1;
        }
    }

    /// The captured frames, most recent caller first.
    #[inline]
    pub fn frames(&self) -> &[Frame] {
        &self.frames[..self.len]
    }

    /// Number of captured frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no frame was captured.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Compares instruction pointers only, order- and length-sensitive.
    #[inline]
    pub fn matches(&self, frames: &[Frame]) -> bool {
        let own = self.frames();
        own.len() == frames.len() && own.iter().zip(frames).all(|(a, b)| a.ip == b.ip)
    }
}

impl PartialEq for StackKey {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other.frames())
    }
}

impl Eq for StackKey {}

impl Default for StackKey {
    fn default() -> Self {
        Self::empty()
    }
}

impl Debug for StackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.frames().iter().map(|frame| std::fmt::from_fn(move |f| write!(f, "{:#x}", frame.ip))))
            .finish()
    }
}

/// Captures up to `depth` frames of the current call stack.
///
/// Frames are skipped up to and including the first frame whose function
/// starts at `skip_through`, so passing the address of the incrementing
/// function excludes it and everything above it (the unwinder and this
/// function) from the key. When no frame starts at that address, for example
/// because the function was inlined or is reached through a thunk, the
/// capture machinery on top of the stack is skipped by position instead.
#[inline(never)]
pub fn capture(depth: usize, skip_through: usize) -> StackKey {
    let depth = depth.min(MAX_STACK_DEPTH);
    let mut key = StackKey::empty();
    if depth == 0 {
        return key;
    }

    let mut found = false;
    backtrace::trace(|frame| {
        if !found {
            found = frame.symbol_address() as usize == skip_through;
            return true;
        }
        key.push(Frame {
            ip: frame.ip() as usize,
            entry: frame.symbol_address() as usize,
        });
        key.len() < depth
    });

    if found {
        key
    } else {
        capture_by_position(depth, skip_through)
    }
}

/// Most frames searched for capture machinery in [`capture_by_position`].
const MAX_MACHINERY_FRAMES: usize = 32;

/// Number of machinery frames on top of the stack, per `skip_through`.
static MACHINERY_FRAMES: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

/// Captures `depth` frames below the capture machinery.
///
/// The first time for a given `skip_through`, the frames are resolved and the
/// position of the last frame belonging to the unwinder, this module or
/// [`StackCounter::inc`](crate::counters::StackCounter::inc) is remembered.
/// Later captures skip that many frames without resolving anything. The call
/// path from `skip_through` to here is fixed, so the count stays valid.
#[inline(never)]
fn capture_by_position(depth: usize, skip_through: usize) -> StackKey {
    let mut frames = [Frame::default(); MAX_STACK_DEPTH + MAX_MACHINERY_FRAMES];
    let mut len = 0;
    backtrace::trace(|frame| {
        frames[len] = Frame {
            ip: frame.ip() as usize,
            entry: frame.symbol_address() as usize,
        };
        len += 1;
        len < frames.len()
    });
    let frames = &frames[..len];

    let skip = {
        let mut known = MACHINERY_FRAMES.lock();
        match known.iter().find(|(addr, _)| *addr == skip_through) {
            Some((_, skip)) => *skip,
            None => {
                let skip = machinery_frames(frames);
                debug!(skip_through, skip, "increment frame not found by address, skipping capture frames by position");
                known.push((skip_through, skip));
                skip
            }
        }
    };

    let below = frames.get(skip..).unwrap_or_default();
    StackKey::from_frames(&below[..depth.min(below.len())])
}

/// Position just past the last capture machinery frame among the first
/// [`MAX_MACHINERY_FRAMES`] frames.
fn machinery_frames(frames: &[Frame]) -> usize {
    let mut skip = 0;
    for (i, frame) in frames.iter().take(MAX_MACHINERY_FRAMES).enumerate() {
        let mut machinery = false;
        backtrace::resolve(frame.ip.saturating_sub(1) as *mut c_void, |symbol| {
            if let Some(name) = symbol.name() {
                machinery |= is_machinery(&format!("{name:#}"));
            }
        });
        if machinery {
            skip = i + 1;
        }
    }
    skip
}

fn is_machinery(name: &str) -> bool {
    name.starts_with("backtrace::")
        || name.starts_with("_Unwind_")
        || name.starts_with("conteggi::symbolize::capture")
        || name.starts_with("conteggi::counters::stack::StackCounter::inc")
}

/// Source location of a resolved frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLocation {
    /// Short function name, for example `server::handle`.
    pub function: String,
    /// Line of the call site.
    pub line: u32,
    /// Line where the enclosing function starts.
    pub entry_line: u32,
}

/// Resolves raw frames to source locations.
///
/// The default implementation is [`BacktraceSymbolizer`]. Tests and hosts
/// with their own symbol tables can substitute another implementation.
pub trait Symbolize: Debug + Send + Sync {
    /// Resolves one frame, or returns `None` if no symbol information exists.
    fn locate(&self, frame: &Frame) -> Option<FrameLocation>;
}

/// Resolves frames with the debug information of the running binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktraceSymbolizer;

impl Symbolize for BacktraceSymbolizer {
    fn locate(&self, frame: &Frame) -> Option<FrameLocation> {
        // Return addresses point past the call instruction.
        let call_site = frame.ip.checked_sub(1)?;

        // With inlining the callback runs once per inlined scope, innermost
        // first. The last one is the real function, which is also the one
        // the entry address resolves to.
        let mut function = None;
        let mut line = None;
        backtrace::resolve(call_site as *mut c_void, |symbol| {
            if let Some(name) = symbol.name() {
                function = Some(short_name(&format!("{name:#}")));
            }
            if let Some(lineno) = symbol.lineno() {
                line = Some(lineno);
            }
        });

        let mut entry_line = None;
        if frame.entry != 0 {
            backtrace::resolve(frame.entry as *mut c_void, |symbol| {
                if let Some(lineno) = symbol.lineno() {
                    entry_line = Some(lineno);
                }
            });
        }

        let line = line?;
        Some(FrameLocation {
            function: function?,
            line,
            entry_line: entry_line.unwrap_or(line),
        })
    }
}

/// Keeps the last two path segments of a demangled name.
///
/// `conteggi::counters::stack::StackCounter::inc` becomes `StackCounter::inc`.
/// Segments inside generic brackets are not split.
fn short_name(name: &str) -> String {
    let mut depth = 0usize;
    let mut cuts = Vec::new();
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                cuts.push(i);
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    match cuts.len() {
        0 | 1 => name.to_string(),
        n => name[cuts[n - 2] + 2..].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality_is_length_sensitive() {
        let a = StackKey::from_ips(&[1, 2, 3]);
        let b = StackKey::from_ips(&[1, 2]);
        assert_ne!(a, b);
        assert_eq!(a, StackKey::from_ips(&[1, 2, 3]));
    }

    #[test]
    fn test_key_equality_is_order_sensitive() {
        assert_ne!(StackKey::from_ips(&[1, 2]), StackKey::from_ips(&[2, 1]));
    }

    #[test]
    fn test_key_ignores_entry_addresses() {
        let a = StackKey::from_frames(&[Frame { ip: 7, entry: 1 }]);
        let b = StackKey::from_frames(&[Frame { ip: 7, entry: 2 }]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_is_bounded() {
        let ips: Vec<usize> = (0..100).collect();
        assert_eq!(StackKey::from_ips(&ips).len(), MAX_STACK_DEPTH);
    }

    #[test]
    fn test_capture_zero_depth() {
        assert!(capture(0, 0).is_empty());
    }

    #[test]
    fn test_capture_respects_depth() {
        let key = capture(3, 0);
        assert!(key.len() <= 3);
        assert!(!key.is_empty());
    }

    #[inline(never)]
    fn call_site() -> StackKey {
        capture(4, call_site as fn() -> StackKey as usize)
    }

    #[test]
    fn test_capture_is_stable_per_call_site() {
        let mut keys = Vec::new();
        for _ in 0..2 {
            keys.push(call_site());
        }
        assert_eq!(keys[0], keys[1]);
    }

    #[inline(never)]
    fn unmatched_site() -> StackKey {
        capture(1, 1)
    }

    #[test]
    fn test_unmatched_skip_address_skips_capture_frames() {
        let key = unmatched_site();
        assert_eq!(key.len(), 1);
        assert_eq!(unmatched_site(), key);

        let location = BacktraceSymbolizer.locate(&key.frames()[0]).unwrap();
        assert!(location.function.ends_with("unmatched_site"), "{location:?}");
    }

    #[test]
    fn test_machinery_names() {
        assert!(is_machinery("backtrace::backtrace::trace_unsynchronized"));
        assert!(is_machinery("conteggi::symbolize::capture_by_position"));
        assert!(is_machinery("conteggi::counters::stack::StackCounter::inc"));
        assert!(!is_machinery("conteggi::symbolize::tests::unmatched_site"));
        assert!(!is_machinery("app::main"));
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("main"), "main");
        assert_eq!(short_name("app::main"), "app::main");
        assert_eq!(short_name("a::b::c::d"), "c::d");
        assert_eq!(
            short_name("a::b::<impl x::Y for z::W>::run"),
            "<impl x::Y for z::W>::run"
        );
        assert_eq!(short_name("a::b::f::{{closure}}"), "f::{{closure}}");
    }
}
