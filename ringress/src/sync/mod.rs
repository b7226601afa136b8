pub mod queue;
pub mod rate;
pub mod ring;
