pub mod repository;
#[cfg(test)]
pub mod test_utilities;
