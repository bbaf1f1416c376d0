pub mod catalog_reader;
pub mod wallet_writer;
