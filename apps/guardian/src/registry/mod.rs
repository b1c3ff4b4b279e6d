//! User records and the guardian registry.

pub mod resolver;
pub mod types;

pub use resolver::{GuardianRegistry, RegistryConfig, RegistryDeps};
pub use types::{
    GuardianInfo, GuardianSlot, GuardianState, OnChainGuardianState, OtpInfo, RegisterResponse,
    RegisteredUsersResponse, RegistrationRequest, SecurityModeRequest, SignMessageRequest,
    SignMessageResponse, SignMultipleTransactionsRequest, SignMultipleTransactionsResponse,
    SignTransactionRequest, SignTransactionResponse, TcsConfig, UserInfo, VerificationRequest,
};
