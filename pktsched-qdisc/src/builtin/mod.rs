mod noop;
pub use noop::{Noop, Noqueue};

mod pfifo_fast;
pub use pfifo_fast::{PfifoFast, PfifoFastConfig, PFIFO_FAST_BANDS, PRIO2BAND, TC_PRIO_MAX};
