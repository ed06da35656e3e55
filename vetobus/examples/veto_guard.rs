/// 否决守卫示例
/// 审核者否决全大写消息，归档只收到其余消息，审计者记录每个 VetoEvent
use std::sync::{Arc, Mutex};
use vetobus::{DispatchConfig, EventBus, HandlerError, HandlerResult, VetoEvent, subscriber};

#[derive(Default)]
struct Moderator;

#[subscriber]
impl Moderator {
    #[handler(veto)]
    fn no_shouting(&self, text: &String) -> HandlerResult {
        if text.chars().any(char::is_lowercase) {
            Ok(())
        } else {
            Err(HandlerError::Veto)
        }
    }
}

#[derive(Default)]
struct Archive {
    kept: Mutex<Vec<String>>,
}

#[subscriber]
impl Archive {
    #[handler]
    fn keep(&self, text: &String) {
        self.kept.lock().unwrap().push(text.clone());
    }
}

#[derive(Default)]
struct Auditor {
    rejected: Mutex<Vec<String>>,
}

#[subscriber]
impl Auditor {
    #[handler]
    fn on_veto(&self, event: &VetoEvent) {
        if let Some(text) = event.downcast_ref::<String>() {
            self.rejected.lock().unwrap().push(text.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let bus = EventBus::builder()
        .config(DispatchConfig {
            handler_concurrency: 4,
            ..Default::default()
        })
        .build();
    let handle = bus.start()?;

    let moderator = Arc::new(Moderator);
    let archive = Arc::new(Archive::default());
    let auditor = Arc::new(Auditor::default());
    bus.subscribe(&moderator)?;
    bus.subscribe(&archive)?;
    bus.subscribe(&auditor)?;

    for text in ["good morning", "STOP THE PRESSES", "see you later"] {
        bus.publish(text.to_string())?;
    }
    bus.wait_idle().await;

    println!("archived: {:?}", archive.kept.lock().unwrap());
    println!("vetoed:   {:?}", auditor.rejected.lock().unwrap());

    handle.shutdown();
    handle.join().await;
    Ok(())
}
