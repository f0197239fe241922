pub mod utils;

#[cfg(test)]
mod tests;
