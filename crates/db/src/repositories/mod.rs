pub mod job_lease_repo;

pub use job_lease_repo::JobLeaseRepo;
