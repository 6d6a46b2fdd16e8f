pub mod endpoint;
pub mod forward;
pub mod transport;
pub mod util;

#[cfg(test)] pub mod test_util;
