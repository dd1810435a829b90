#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };
}

pub(crate) use imp::*;
