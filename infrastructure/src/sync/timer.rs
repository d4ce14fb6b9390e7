use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

/// Runs `f` on a fixed interval until it breaks. The first run is immediate.
pub async fn new<T, F, Fut>(interval: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlFlow<T>>,
{
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;

        if let ControlFlow::Break(ret) = f().await {
            break ret;
        }
    }
}

/// Like [`new`], but the delay before each run is asked from `interval`, so
/// a reloaded setting takes effect on the next round.
pub async fn dynamic<T, I, F, Fut>(mut interval: I, mut f: F) -> T
where
    I: FnMut() -> ControlFlow<T, Duration>,
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlFlow<T>>,
{
    loop {
        match interval() {
            ControlFlow::Continue(delay) => tokio::time::sleep(delay).await,
            ControlFlow::Break(ret) => break ret,
        }

        if let ControlFlow::Break(ret) = f().await {
            break ret;
        }
    }
}
