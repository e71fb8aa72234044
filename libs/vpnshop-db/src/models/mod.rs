pub mod activity;
pub mod catalog;
pub mod order;
pub mod promo;
pub mod referral;
pub mod session;
pub mod support;
pub mod user;
