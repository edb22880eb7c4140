use aya_ebpf::{
    macros::{map, uprobe},
    maps::{HashMap, RingBuf, ring_buf::RingBufEntry},
    programs::ProbeContext,
};
use lockwatch_common::{
    CaptureOutcome, EVENTS_RING_BYTES, EventRing, EventSlot, FilterMode, MAX_FILTER_ENTRIES,
    MountNsFilter, MutexEvent, Operation, capture,
};

use super::{CurrentTask, load_config, record_outcome};

#[map]
pub static EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_RING_BYTES, 0);

/// Mount namespace ids, interpreted according to `ProbeConfig::filter_mode`.
#[map]
pub static MNTNS_FILTER: HashMap<u64, u8> = HashMap::with_max_entries(MAX_FILTER_ENTRIES, 0);

struct NamespaceFilter {
    mode: FilterMode,
}

impl MountNsFilter for NamespaceFilter {
    #[inline(always)]
    fn should_discard(&self, mntns_id: u64) -> bool {
        if self.mode == FilterMode::Disabled {
            return false;
        }
        let listed = unsafe { MNTNS_FILTER.get(&mntns_id) }.is_some();
        self.mode.discards(listed)
    }
}

struct EventsRing;

struct ReservedEvent(RingBufEntry<MutexEvent>);

impl EventSlot for ReservedEvent {
    #[inline(always)]
    fn write(&mut self, event: MutexEvent) {
        self.0.write(event);
    }

    #[inline(always)]
    fn submit(self) {
        self.0.submit(0);
    }

    #[inline(always)]
    fn discard(self) {
        self.0.discard(0);
    }
}

impl EventRing for EventsRing {
    type Slot = ReservedEvent;

    #[inline(always)]
    fn reserve(&self) -> Option<ReservedEvent> {
        EVENTS.reserve::<MutexEvent>(0).map(ReservedEvent)
    }
}

#[uprobe]
pub fn trace_uprobe_mutex_lock(ctx: ProbeContext) -> u32 {
    on_mutex_call(&ctx, Operation::Lock)
}

#[uprobe]
pub fn trace_uprobe_mutex_unlock(ctx: ProbeContext) -> u32 {
    on_mutex_call(&ctx, Operation::Unlock)
}

/// The traced call always proceeds; the outcome only lands in `STATS`.
#[inline(always)]
fn on_mutex_call(ctx: &ProbeContext, operation: Operation) -> u32 {
    let config = load_config();
    // arg0 is the pthread_mutex_t pointer for both entry points.
    let outcome = match ctx.arg::<u64>(0) {
        Some(mutex_addr) => capture(
            &CurrentTask::new(&config),
            &NamespaceFilter {
                mode: config.filter_mode(),
            },
            &EventsRing,
            operation,
            mutex_addr,
        ),
        None => CaptureOutcome::Aborted,
    };
    record_outcome(outcome);
    0
}
