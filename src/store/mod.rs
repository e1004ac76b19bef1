//! Account-balance collaborators the reward gateway credits

pub mod accounts;

pub use accounts::{AccountsClient, HttpAccounts, LogAccounts};
