pub mod events;
pub mod listener;
pub mod pool;
pub mod soap;

pub use listener::OnvifListener;
pub use pool::ListenerPool;
pub use soap::SoapClient;
