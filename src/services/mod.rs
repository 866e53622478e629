pub mod bill_generation;
pub mod bill_stats;
pub mod contract_activation;
pub mod reading_consistency;
pub mod settings;
