mod test_memory;
mod test_postgres;
