// Pure safe-range computations. Storage access, locking and waiting live in the executor.
pub mod file_list;
pub mod sequence;
pub mod time_interval;
