//! Event bit masks delivered to watcher callbacks.
//!
//! A watcher callback receives an [`Events`] value describing why it was
//! invoked. Io watchers also use it as their interest mask (`READ`, `WRITE`).

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Events(u32);

impl Events {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(0x01);
    pub const WRITE: Self = Self(0x02);
    /// Internal: forces the backend to be told about an fd even if the mask is unchanged.
    pub(crate) const IOFDSET: Self = Self(0x80);
    pub const TIMER: Self = Self(0x0000_0100);
    pub const PERIODIC: Self = Self(0x0000_0200);
    pub const SIGNAL: Self = Self(0x0000_0400);
    pub const CHILD: Self = Self(0x0000_0800);
    pub const STAT: Self = Self(0x0000_1000);
    pub const IDLE: Self = Self(0x0000_2000);
    pub const PREPARE: Self = Self(0x0000_4000);
    pub const CHECK: Self = Self(0x0000_8000);
    pub const EMBED: Self = Self(0x0001_0000);
    pub const FORK: Self = Self(0x0002_0000);
    pub const CLEANUP: Self = Self(0x0004_0000);
    pub const ASYNC: Self = Self(0x0008_0000);
    pub const CUSTOM: Self = Self(0x0100_0000);
    pub const ERROR: Self = Self(0x8000_0000);

    /// Watcher kinds, used as the type mask for [`Loop::walk`](crate::Loop::walk).
    pub const IO: Self = Self::READ;
    pub const ALL_KINDS: Self = Self(
        Self::IO.0
            | Self::TIMER.0
            | Self::PERIODIC.0
            | Self::SIGNAL.0
            | Self::CHILD.0
            | Self::STAT.0
            | Self::IDLE.0
            | Self::PREPARE.0
            | Self::CHECK.0
            | Self::EMBED.0
            | Self::FORK.0
            | Self::CLEANUP.0
            | Self::ASYNC.0,
    );

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// The readiness part of the mask (`READ | WRITE`).
    pub const fn io(self) -> Self {
        Self(self.0 & (Self::READ.0 | Self::WRITE.0))
    }
}

impl BitOr for Events {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Events {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for Events {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for Events {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Events, &str); 17] = [
            (Events::READ, "READ"),
            (Events::WRITE, "WRITE"),
            (Events::IOFDSET, "IOFDSET"),
            (Events::TIMER, "TIMER"),
            (Events::PERIODIC, "PERIODIC"),
            (Events::SIGNAL, "SIGNAL"),
            (Events::CHILD, "CHILD"),
            (Events::STAT, "STAT"),
            (Events::IDLE, "IDLE"),
            (Events::PREPARE, "PREPARE"),
            (Events::CHECK, "CHECK"),
            (Events::EMBED, "EMBED"),
            (Events::FORK, "FORK"),
            (Events::CLEANUP, "CLEANUP"),
            (Events::ASYNC, "ASYNC"),
            (Events::CUSTOM, "CUSTOM"),
            (Events::ERROR, "ERROR"),
        ];

        if self.is_empty() {
            return f.write_str("NONE");
        }

        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }

        Ok(())
    }
}
