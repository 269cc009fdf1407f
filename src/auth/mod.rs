pub mod accounts;
pub mod jwt;
pub mod middleware;
pub mod totp;
