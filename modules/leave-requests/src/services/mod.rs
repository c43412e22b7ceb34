pub mod approval_policy;
