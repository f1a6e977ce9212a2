pub mod invoice;
pub mod mock;
pub mod wait;
