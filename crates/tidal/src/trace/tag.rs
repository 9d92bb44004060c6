use smallvec::SmallVec;
use std::{
    fmt::{self, Display},
    panic::Location,
};

/// Identifies one traced operation across re-executions of the traced
/// function.
///
/// The source location of the call into the trace context is combined with
/// the explicit frames pushed by operator code, so that the same location
/// reached through different operators (or different nodes of one
/// expression) yields different tags. Seeing a tag a second time means that
/// control flow merged, either at the end of a conditional or along the back
/// edge of a loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    location: &'static Location<'static>,
    frames: SmallVec<[u32; 8]>,
}

impl Tag {
    pub(crate) fn new(location: &'static Location<'static>, frames: &[u32]) -> Self {
        Self {
            location,
            frames: SmallVec::from_slice(frames),
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub fn frames(&self) -> &[u32] {
        &self.frames
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location)?;
        for frame in &self.frames {
            write!(f, "#{frame}")?;
        }
        Ok(())
    }
}
