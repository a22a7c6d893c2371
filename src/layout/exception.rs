//! `Il2CppException` layouts

use super::{Raw, StructKind};
use crate::memory::NativeHandle;
use crate::version::UnityVersion;

#[derive(Debug)]
pub struct ExceptionLayout {
    pub label: &'static str,
    pub since: UnityVersion,
    pub size: u16,
    pub class_name: u16,
    pub message: u16,
    pub data: u16,
    pub inner_exception: u16,
    pub help_link: u16,
    pub stack_trace: u16,
    pub remote_stack_trace: u16,
    pub hresult: u16,
    pub source: u16,
}

pub static EXCEPTION_16_0: ExceptionLayout = ExceptionLayout {
    label: "Exception_16_0",
    since: UnityVersion::new(5, 2, 0),
    size: 112,
    inner_exception: 24,
    message: 32,
    help_link: 40,
    class_name: 48,
    stack_trace: 56,
    remote_stack_trace: 64,
    hresult: 76,
    source: 80,
    data: 88,
};

/// 2019.1 follows the corefx field order
pub static EXCEPTION_24_1: ExceptionLayout = ExceptionLayout {
    label: "Exception_24_1",
    since: UnityVersion::new(2019, 1, 0),
    size: 136,
    class_name: 16,
    message: 24,
    data: 32,
    inner_exception: 40,
    help_link: 48,
    stack_trace: 64,
    remote_stack_trace: 72,
    hresult: 96,
    source: 104,
};

pub static LAYOUTS: [&ExceptionLayout; 2] = [&EXCEPTION_16_0, &EXCEPTION_24_1];

/// A native `Il2CppException` object
#[derive(Clone, Copy)]
pub struct ExceptionStruct {
    raw: Raw,
    layout: &'static ExceptionLayout,
}

layout_descriptor!(ExceptionLayout, ExceptionStruct, StructKind::Exception);

impl ExceptionStruct {
    pub(crate) fn new(ptr: NativeHandle, layout: &'static ExceptionLayout) -> Self {
        ExceptionStruct { raw: Raw::new(ptr), layout }
    }

    handle_fields! {
        /// `Il2CppString*`
        class_name, set_class_name => class_name;
        /// `Il2CppString*`
        message, set_message => message;
        data, set_data => data;
        inner_exception, set_inner_exception => inner_exception;
        help_link, set_help_link => help_link;
        stack_trace, set_stack_trace => stack_trace;
        remote_stack_trace, set_remote_stack_trace => remote_stack_trace;
        source, set_source => source;
    }

    value_fields! {
        hresult, set_hresult: i32 => hresult;
    }
}
