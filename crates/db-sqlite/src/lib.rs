mod histograms;
pub mod sqlite_dao;
