use core::alloc::Layout;

use thiserror::Error;

/// Failure of a fallible constructor. Nothing is committed when one of these
/// is returned: no handle exists and no counts were touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to allocate a control block ({size} bytes, align {align})")]
    ControlBlock { size: usize, align: usize },

    #[error("failed to allocate a combined object and control block ({size} bytes, align {align})")]
    Combined { size: usize, align: usize },
}

impl Error {
    #[cold]
    pub(crate) fn control_block(layout: Layout) -> Self {
        Error::ControlBlock {
            size: layout.size(),
            align: layout.align(),
        }
    }

    #[cold]
    pub(crate) fn combined(layout: Layout) -> Self {
        Error::Combined {
            size: layout.size(),
            align: layout.align(),
        }
    }
}
