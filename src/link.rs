//! Link drivers move raw signals or bytes between the host and an adapter.  A link is created
//! by its `connect` constructor, which only finds the device, and is claimed with
//! [`Link::open`].  Dropping a link releases it.
//!
//! Links that can only wiggle TMS/TCK/TDI and sample TDO implement [`SignalLink`]; the generic
//! [`BitBang`](crate::cable::bitbang::BitBang) cable turns those into a [`Cable`](crate::cable::Cable).
use crate::error::Result;

pub mod gpio;
pub mod sim;
#[cfg(feature = "std")]
pub mod usbconn;

pub trait Link {
    /// Claim the device.  On failure the link stays usable and `open` may be retried.
    fn open(&mut self) -> Result<()>;

    /// Give up the claim taken by `open`.  Closing a closed link does nothing.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

pub trait SignalLink: Link {
    /// Drive all three outputs at once.  TCK rising with this call is the clock edge.
    fn set_signal(&mut self, tms: bool, tck: bool, tdi: bool) -> Result<()>;

    /// Sample TDO.
    fn get_signal(&mut self) -> Result<bool>;
}
