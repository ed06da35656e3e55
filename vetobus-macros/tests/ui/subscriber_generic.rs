use std::marker::PhantomData;
use vetobus::{Subscriber, VetoEvent, subscriber};

struct Watcher<T> {
    _marker: PhantomData<fn() -> T>,
}

#[subscriber]
impl<T: 'static> Watcher<T> {
    #[handler]
    fn on_veto(&self, event: &VetoEvent) {
        let _ = event.message_type();
    }
}

fn main() {
    assert_eq!(Watcher::<u8>::handlers().len(), 1);
}
