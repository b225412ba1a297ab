pub mod relay;
pub mod test_util;
pub mod transport;
