//! `EventInfo` layouts

use super::{Raw, StructKind};
use crate::memory::NativeHandle;
use crate::version::UnityVersion;

#[derive(Debug)]
pub struct EventLayout {
    pub label: &'static str,
    pub since: UnityVersion,
    pub size: u16,
    pub name: u16,
    pub event_type: u16,
    pub parent: u16,
    pub add: u16,
    pub remove: u16,
    pub raise: u16,
    pub custom_attribute_index: Option<u16>,
    pub token: u16,
}

pub static EVENT_16_0: EventLayout = EventLayout {
    label: "EventInfo_16_0",
    since: UnityVersion::new(5, 2, 0),
    size: 56,
    name: 0,
    event_type: 8,
    parent: 16,
    add: 24,
    remove: 32,
    raise: 40,
    custom_attribute_index: Some(48),
    token: 52,
};

pub static EVENT_24_1: EventLayout = EventLayout {
    label: "EventInfo_24_1",
    since: UnityVersion::new(2018, 3, 0),
    size: 56,
    name: 0,
    event_type: 8,
    parent: 16,
    add: 24,
    remove: 32,
    raise: 40,
    custom_attribute_index: None,
    token: 48,
};

pub static LAYOUTS: [&EventLayout; 2] = [&EVENT_16_0, &EVENT_24_1];

/// A native `EventInfo`
#[derive(Clone, Copy)]
pub struct EventStruct {
    raw: Raw,
    layout: &'static EventLayout,
}

layout_descriptor!(EventLayout, EventStruct, StructKind::EventInfo);

impl EventStruct {
    pub(crate) fn new(ptr: NativeHandle, layout: &'static EventLayout) -> Self {
        EventStruct { raw: Raw::new(ptr), layout }
    }

    handle_fields! {
        name, set_name => name;
        event_type, set_event_type => event_type;
        parent, set_parent => parent;
        add, set_add => add;
        remove, set_remove => remove;
        raise, set_raise => raise;
    }

    value_fields! {
        token, set_token: u32 => token;
    }

    optional_value_fields! {
        custom_attribute_index, set_custom_attribute_index: i32 => custom_attribute_index;
    }

    pub fn name_str(&self) -> Option<String> {
        self.raw.cstr(self.layout.name)
    }
}
