//! 배치 리스너 등록 및 전달

use crate::error::Result;
use crate::events::DmlEventBatch;

/// 완성된 배치를 받는 소비자 (writer, 검증기 등)
pub trait EventListener: Send {
    fn on_batch(&mut self, batch: &DmlEventBatch) -> Result<()>;
}

impl<F> EventListener for F
where
    F: FnMut(&DmlEventBatch) -> Result<()> + Send,
{
    fn on_batch(&mut self, batch: &DmlEventBatch) -> Result<()> {
        self(batch)
    }
}

/// 등록 순서대로 호출되는 리스너 목록
#[derive(Default)]
pub struct ListenerSet {
    listeners: Vec<Box<dyn EventListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        ListenerSet::default()
    }

    pub fn add<L: EventListener + 'static>(&mut self, listener: L) {
        self.listeners.push(Box::new(listener));
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// 첫 에러에서 멈추고 그 에러를 그대로 반환
    pub fn dispatch(&mut self, batch: &DmlEventBatch) -> Result<()> {
        for listener in self.listeners.iter_mut() {
            listener.on_batch(batch)?;
        }
        Ok(())
    }
}
