pub type Result<T> = eyre::Result<T>;
