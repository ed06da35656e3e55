use vetobus::{HandlerError, HandlerResult, Subscriber, subscriber};

struct Audit;

#[subscriber]
impl Audit {
    #[handler]
    fn on_text(&self, text: &String) {
        let _ = text.len();
    }

    #[handler(veto)]
    fn guard(&self, text: &String) -> HandlerResult {
        if text.is_empty() {
            return Err(HandlerError::Veto);
        }
        Ok(())
    }

    #[handler(veto = false)]
    fn on_count(&self, count: u64) -> anyhow::Result<()> {
        let _ = count;
        Ok(())
    }

    fn helper(&self) {}
}

fn main() {
    let bindings = Audit::handlers();
    assert_eq!(bindings.len(), 3);
    assert!(bindings[1].is_veto_capable());
    Audit.helper();
}
