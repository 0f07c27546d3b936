pub mod bdev;
pub mod compress;
pub mod counter;
pub mod diff;
pub mod fullsync;
pub mod meta;
pub mod queue;
pub mod registry;
pub mod state_machine;
pub mod stop;
pub mod task;
pub mod throughput;
pub mod volume;
pub mod wdiff_net;
pub mod wlog;
pub mod wlog_net;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
