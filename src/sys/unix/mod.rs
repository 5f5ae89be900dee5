#[cfg(target_os = "linux")]
mod awakener;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub use self::awakener::EventFd;

#[cfg(target_os = "linux")]
pub use self::epoll::EpollProvider;
