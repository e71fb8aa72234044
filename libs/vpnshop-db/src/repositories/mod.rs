pub mod activity_repo;
pub mod catalog_repo;
pub mod ledger_repo;
pub mod order_repo;
pub mod profile_repo;
pub mod promo_repo;
pub mod referral_repo;
pub mod support_repo;
pub mod user_repo;
