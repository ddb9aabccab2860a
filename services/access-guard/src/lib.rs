//! access-guard - 问卷访问守卫
//!
//! 邮箱验证码、按客户端限流、重复提交拦截，三者共享同一套带降级的键值存储

pub mod client;
pub mod guard;
pub mod maintenance;
pub mod rate_limit;
pub mod store;
pub mod submission;
pub mod verification;

pub use client::ClientIdentity;
pub use guard::{AccessGuard, CodeDispatch, SubmissionOutcome};
pub use rate_limit::{RateLimitDecision, RateLimitPolicy, RateLimiter};
pub use store::{FailoverStore, GuardStores};
pub use submission::{
    SubmissionClaim, SubmissionRecord, SubmissionStatus, SubmissionTracker, generate_identifier,
};
pub use verification::{
    CodeIssued, VerificationCodeManager, VerificationEntry, VerificationSettings, VerifyFailure,
    VerifyResult, generate_code, normalize,
};
