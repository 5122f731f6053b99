


#[cfg(test)]
mod storage_backend_tests;
