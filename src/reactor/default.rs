//! The process-wide default loop.
//!
//! The default loop is the only one that reaps child processes. It is
//! created on first use and bound to the thread that created it; other
//! threads cannot obtain it until it is destroyed.

use crate::builder::LoopBuilder;
use crate::error::{Error, Result};
use crate::reactor::core::Loop;
use crate::trace::debug;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, ThreadId};

static OWNER: Mutex<Option<ThreadId>> = Mutex::new(None);

thread_local! {
    static DEFAULT: RefCell<Option<Rc<RefCell<Loop>>>> = const { RefCell::new(None) };
}

/// Returns the default loop, creating it from `builder` on first use.
///
/// Later calls on the same thread ignore `builder` and return the existing
/// loop.
///
/// # Errors
/// [`Error::DefaultLoopUnavailable`] when another thread owns the default
/// loop, or the builder's error if creating it fails.
///
/// # Example
/// ```ignore
/// let lp = default_loop(LoopBuilder::new())?;
/// let child = lp.borrow_mut().child(pid, false, |_, _, _| {})?;
/// ```
pub fn default_loop(builder: LoopBuilder) -> Result<Rc<RefCell<Loop>>> {
    if let Some(lp) = DEFAULT.with(|d| d.borrow().clone()) {
        return Ok(lp);
    }

    let me = thread::current().id();
    {
        let mut owner = OWNER.lock().unwrap_or_else(PoisonError::into_inner);
        if owner.is_some_and(|t| t != me) {
            return Err(Error::DefaultLoopUnavailable);
        }
        *owner = Some(me);
    }

    let mut lp = match builder.build() {
        Ok(lp) => lp,
        Err(err) => {
            *OWNER.lock().unwrap_or_else(PoisonError::into_inner) = None;
            return Err(err);
        }
    };

    lp.is_default = true;
    lp.child_init();
    debug!(backend = ?lp.backend(), "default loop created");

    let lp = Rc::new(RefCell::new(lp));
    DEFAULT.with(|d| *d.borrow_mut() = Some(lp.clone()));

    Ok(lp)
}

/// Releases the default loop so it can be created again, possibly on another
/// thread. The loop itself is destroyed when its last handle is dropped.
///
/// Does nothing when called on a thread that does not own it.
pub fn destroy_default_loop() {
    let Some(lp) = DEFAULT.with(|d| d.borrow_mut().take()) else {
        return;
    };

    drop(lp);
    *OWNER.lock().unwrap_or_else(PoisonError::into_inner) = None;
    debug!("default loop released");
}
