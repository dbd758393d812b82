pub mod job_lease;
