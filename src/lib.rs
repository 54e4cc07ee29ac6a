pub mod branch;
pub mod config;
pub mod connection;
pub mod gate;
pub mod listener;
pub mod message;
pub mod reader;
pub mod transport;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
