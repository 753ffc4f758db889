//! CoreAudio HAL 后端
//!
//! 直接走 HAL IOProc API，绕过 AudioUnit 层。属性读写用
//! AudioObjectGet/SetPropertyData，回调用 AudioDeviceCreateIOProcID。
//! 这里只做平台粘合：所有协商决策、致命性判定都在驱动层。

use std::ffi::c_void;
use std::ptr;
use std::sync::{Arc, Mutex};

use super::driver::RenderEngine;
use super::format::StreamFormat;
use super::host::{DeviceId, HostError, OutputHost, OverloadSink};

type OSStatus = i32;
type AudioObjectID = u32;
type AudioDeviceID = u32;
type AudioObjectPropertySelector = u32;
type AudioObjectPropertyScope = u32;
type AudioObjectPropertyElement = u32;
type AudioDeviceIOProcID = *mut c_void;

const NO_ERR: OSStatus = 0;

const K_AUDIO_OBJECT_SYSTEM_OBJECT: AudioObjectID = 1;
const K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE: AudioObjectPropertySelector = 0x644F7574; // 'dOut'
const K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE: AudioObjectPropertySelector = 0x6E737274; // 'nsrt'
const K_AUDIO_DEVICE_PROPERTY_STREAM_FORMAT: AudioObjectPropertySelector = 0x73666D74; // 'sfmt'
const K_AUDIO_DEVICE_PROPERTY_BUFFER_FRAME_SIZE: AudioObjectPropertySelector = 0x6673697A; // 'fsiz'
const K_AUDIO_DEVICE_PROPERTY_LATENCY: AudioObjectPropertySelector = 0x6C746E63; // 'ltnc'
const K_AUDIO_DEVICE_PROPERTY_SAFETY_OFFSET: AudioObjectPropertySelector = 0x73616674; // 'saft'
const K_AUDIO_DEVICE_PROPERTY_STREAMS: AudioObjectPropertySelector = 0x73746D23; // 'stm#'
const K_AUDIO_DEVICE_PROCESSOR_OVERLOAD: AudioObjectPropertySelector = 0x6F766572; // 'over'

const K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT: AudioObjectPropertyScope = 0x6F757470; // 'outp'
const K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL: AudioObjectPropertyScope = 0x676C6F62; // 'glob'
const K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN: AudioObjectPropertyElement = 0;

const K_AUDIO_FORMAT_LINEAR_PCM: u32 = 0x6C70636D; // 'lpcm'

const K_AUDIO_TIME_STAMP_SAMPLE_TIME_VALID: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct AudioObjectPropertyAddress {
    selector: AudioObjectPropertySelector,
    scope: AudioObjectPropertyScope,
    element: AudioObjectPropertyElement,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct AudioStreamBasicDescription {
    sample_rate: f64,
    format_id: u32,
    format_flags: u32,
    bytes_per_packet: u32,
    frames_per_packet: u32,
    bytes_per_frame: u32,
    channels_per_frame: u32,
    bits_per_channel: u32,
    reserved: u32,
}

impl AudioStreamBasicDescription {
    fn from_stream_format(format: &StreamFormat) -> Self {
        Self {
            sample_rate: format.sample_rate,
            format_id: K_AUDIO_FORMAT_LINEAR_PCM,
            format_flags: format.flags,
            bytes_per_packet: format.bytes_per_packet,
            frames_per_packet: format.frames_per_packet,
            bytes_per_frame: format.bytes_per_frame,
            channels_per_frame: format.channels_per_frame,
            bits_per_channel: format.bits_per_channel,
            reserved: 0,
        }
    }

    fn to_stream_format(self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.sample_rate,
            flags: self.format_flags,
            bytes_per_packet: self.bytes_per_packet,
            frames_per_packet: self.frames_per_packet,
            bytes_per_frame: self.bytes_per_frame,
            channels_per_frame: self.channels_per_frame,
            bits_per_channel: self.bits_per_channel,
        }
    }
}

#[repr(C)]
#[derive(Default)]
struct SMPTETime {
    subframes: i16,
    subframe_divisor: i16,
    counter: u32,
    smpte_type: u32,
    flags: u32,
    hours: i16,
    minutes: i16,
    seconds: i16,
    frames: i16,
}

#[repr(C)]
#[derive(Default)]
struct AudioTimeStamp {
    sample_time: f64,
    host_time: u64,
    rate_scalar: f64,
    word_clock_time: u64,
    smpte_time: SMPTETime,
    flags: u32,
    reserved: u32,
}

impl AudioTimeStamp {
    /// 取有效的 sample_time，无效时返回 0
    #[inline]
    fn valid_sample_time(&self) -> i64 {
        if (self.flags & K_AUDIO_TIME_STAMP_SAMPLE_TIME_VALID) != 0 {
            self.sample_time as i64
        } else {
            0
        }
    }
}

#[repr(C)]
struct AudioBufferList {
    number_buffers: u32,
    buffers: [AudioBuffer; 1], // 交织格式只有一个 buffer（非交织在协商时已被拒）
}

#[repr(C)]
struct AudioBuffer {
    number_channels: u32,
    data_byte_size: u32,
    data: *mut c_void,
}

type PropertyListenerProc = unsafe extern "C" fn(
    in_object_id: AudioObjectID,
    in_number_addresses: u32,
    in_addresses: *const AudioObjectPropertyAddress,
    in_client_data: *mut c_void,
) -> OSStatus;

#[link(name = "CoreAudio", kind = "framework")]
extern "C" {
    fn AudioObjectGetPropertyData(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        io_data_size: *mut u32,
        out_data: *mut c_void,
    ) -> OSStatus;

    fn AudioObjectSetPropertyData(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        qualifier_data_size: u32,
        qualifier_data: *const c_void,
        data_size: u32,
        data: *const c_void,
    ) -> OSStatus;

    fn AudioObjectAddPropertyListener(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        listener: PropertyListenerProc,
        client_data: *mut c_void,
    ) -> OSStatus;

    fn AudioObjectRemovePropertyListener(
        object_id: AudioObjectID,
        address: *const AudioObjectPropertyAddress,
        listener: PropertyListenerProc,
        client_data: *mut c_void,
    ) -> OSStatus;

    // HAL IOProc API - 直接硬件访问，绕过 AudioUnit 层
    fn AudioDeviceCreateIOProcID(
        in_device: AudioDeviceID,
        in_proc: Option<
            unsafe extern "C" fn(
                in_device: AudioObjectID,
                in_now: *const AudioTimeStamp,
                in_input_data: *const AudioBufferList,
                in_input_time: *const AudioTimeStamp,
                out_output_data: *mut AudioBufferList,
                in_output_time: *const AudioTimeStamp,
                in_client_data: *mut c_void,
            ) -> OSStatus,
        >,
        in_client_data: *mut c_void,
        out_io_proc_id: *mut AudioDeviceIOProcID,
    ) -> OSStatus;

    fn AudioDeviceDestroyIOProcID(
        in_device: AudioDeviceID,
        in_io_proc_id: AudioDeviceIOProcID,
    ) -> OSStatus;

    fn AudioDeviceStart(in_device: AudioDeviceID, in_proc_id: AudioDeviceIOProcID) -> OSStatus;

    fn AudioDeviceStop(in_device: AudioDeviceID, in_proc_id: AudioDeviceIOProcID) -> OSStatus;

    fn AudioDeviceGetCurrentTime(
        in_device: AudioDeviceID,
        out_time: *mut AudioTimeStamp,
    ) -> OSStatus;
}

/// 实时回调蹦床：client_data 是 Arc::into_raw 的 RenderEngine
///
/// 回调线程上只做指针还原和切片构造，其余交给 RenderEngine::render。
/// 任何情况下都返回 noErr：错误上抛会让 HAL 停设备。
unsafe extern "C" fn io_proc(
    _in_device: AudioObjectID,
    in_now: *const AudioTimeStamp,
    _in_input_data: *const AudioBufferList,
    _in_input_time: *const AudioTimeStamp,
    out_output_data: *mut AudioBufferList,
    in_output_time: *const AudioTimeStamp,
    in_client_data: *mut c_void,
) -> OSStatus {
    if out_output_data.is_null() || in_client_data.is_null() {
        return NO_ERR;
    }

    let engine = &*(in_client_data as *const RenderEngine);
    let list = &mut *out_output_data;
    if list.number_buffers == 0 {
        return NO_ERR;
    }

    let buffer = &mut list.buffers[0];
    if buffer.data.is_null() || buffer.data_byte_size == 0 {
        return NO_ERR;
    }
    let out = std::slice::from_raw_parts_mut(buffer.data as *mut u8, buffer.data_byte_size as usize);

    let now = if in_now.is_null() {
        0
    } else {
        (*in_now).valid_sample_time()
    };
    let output_time = if in_output_time.is_null() {
        now
    } else {
        (*in_output_time).valid_sample_time()
    };

    engine.render(out, now, output_time);
    NO_ERR
}

/// 过载监听蹦床：client_data 是 Arc::into_raw 的 ListenerCtx
unsafe extern "C" fn overload_listener(
    _in_object_id: AudioObjectID,
    _in_number_addresses: u32,
    _in_addresses: *const AudioObjectPropertyAddress,
    in_client_data: *mut c_void,
) -> OSStatus {
    if !in_client_data.is_null() {
        let ctx = &*(in_client_data as *const ListenerCtx);
        ctx.sink.on_overload();
    }
    NO_ERR
}

/// 蹦床用的胖指针落地点（dyn trait 不能直接穿过 c_void）
struct ListenerCtx {
    sink: Arc<dyn OverloadSink>,
}

fn overload_address() -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        selector: K_AUDIO_DEVICE_PROCESSOR_OVERLOAD,
        scope: K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
        element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
    }
}

/// 后端持有的已注册资源
///
/// 两个裸指针都来自 Arc::into_raw，只作为不透明令牌保存，
/// 在 remove_* 里还原成 Arc 释放。
struct BackendState {
    io_proc_id: AudioDeviceIOProcID,
    engine_ptr: *const RenderEngine,
    listener_ptr: *const ListenerCtx,
}

impl BackendState {
    fn new() -> Self {
        Self {
            io_proc_id: ptr::null_mut(),
            engine_ptr: ptr::null(),
            listener_ptr: ptr::null(),
        }
    }
}

// 指针只在持锁状态下读写，引用计数由 into_raw/from_raw 配对管理
unsafe impl Send for BackendState {}

/// CoreAudio HAL 输出后端
pub struct CoreAudioHost {
    state: Mutex<BackendState>,
}

impl CoreAudioHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState::new()),
        }
    }

    /// 读全局 scope 的定长属性
    fn get_property<T: Default>(
        object: AudioObjectID,
        selector: AudioObjectPropertySelector,
        scope: AudioObjectPropertyScope,
        what: &'static str,
    ) -> Result<T, HostError> {
        let address = AudioObjectPropertyAddress {
            selector,
            scope,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };
        let mut value = T::default();
        let mut size = std::mem::size_of::<T>() as u32;
        let status = unsafe {
            AudioObjectGetPropertyData(
                object,
                &address,
                0,
                ptr::null(),
                &mut size,
                &mut value as *mut T as *mut c_void,
            )
        };
        if status == NO_ERR {
            Ok(value)
        } else {
            Err(HostError::new(status, what))
        }
    }

    fn set_property<T>(
        object: AudioObjectID,
        selector: AudioObjectPropertySelector,
        scope: AudioObjectPropertyScope,
        value: &T,
        what: &'static str,
    ) -> Result<(), HostError> {
        let address = AudioObjectPropertyAddress {
            selector,
            scope,
            element: K_AUDIO_OBJECT_PROPERTY_ELEMENT_MAIN,
        };
        let status = unsafe {
            AudioObjectSetPropertyData(
                object,
                &address,
                0,
                ptr::null(),
                std::mem::size_of::<T>() as u32,
                value as *const T as *const c_void,
            )
        };
        if status == NO_ERR {
            Ok(())
        } else {
            Err(HostError::new(status, what))
        }
    }

    /// 输出侧第一条流的对象 ID
    fn first_output_stream(device: DeviceId) -> Option<AudioObjectID> {
        let stream: AudioObjectID = Self::get_property(
            device,
            K_AUDIO_DEVICE_PROPERTY_STREAMS,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
            "GetStreams",
        )
        .ok()?;
        if stream == 0 {
            None
        } else {
            Some(stream)
        }
    }
}

impl Default for CoreAudioHost {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputHost for CoreAudioHost {
    fn default_output_device(&self) -> Result<DeviceId, HostError> {
        let device: AudioDeviceID = Self::get_property(
            K_AUDIO_OBJECT_SYSTEM_OBJECT,
            K_AUDIO_HARDWARE_PROPERTY_DEFAULT_OUTPUT_DEVICE,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            "GetDefaultOutputDevice",
        )?;
        if device == 0 {
            return Err(HostError::new(-1, "GetDefaultOutputDevice"));
        }
        Ok(device)
    }

    fn device_name(&self, device: DeviceId) -> Option<String> {
        // 走 coreaudio_sys 的 CFString 属性
        use core_foundation::base::TCFType;
        use core_foundation::string::CFString;
        use coreaudio_sys::{
            kAudioObjectPropertyElementMain, kAudioObjectPropertyName,
            kAudioObjectPropertyScopeGlobal, AudioObjectGetPropertyData as sysGetPropertyData,
            AudioObjectPropertyAddress as SysPropertyAddress,
        };

        let address = SysPropertyAddress {
            mSelector: kAudioObjectPropertyName,
            mScope: kAudioObjectPropertyScopeGlobal,
            mElement: kAudioObjectPropertyElementMain,
        };

        let mut size: u32 = std::mem::size_of::<*const c_void>() as u32;
        let mut cf_string_ref: *const c_void = ptr::null();
        let status = unsafe {
            sysGetPropertyData(
                device,
                &address,
                0,
                ptr::null(),
                &mut size,
                &mut cf_string_ref as *mut _ as *mut c_void,
            )
        };
        if status != 0 || cf_string_ref.is_null() {
            return None;
        }

        // wrap_under_create_rule：属性返回 +1 引用，由我们 release
        let cf_string = unsafe { CFString::wrap_under_create_rule(cf_string_ref as *const _) };
        Some(cf_string.to_string())
    }

    fn nominal_sample_rate(&self, device: DeviceId) -> Result<f64, HostError> {
        Self::get_property(
            device,
            K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            "GetNominalSampleRate",
        )
    }

    fn set_nominal_sample_rate(&self, device: DeviceId, rate: f64) -> Result<(), HostError> {
        Self::set_property(
            device,
            K_AUDIO_DEVICE_PROPERTY_NOMINAL_SAMPLE_RATE,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            &rate,
            "SetNominalSampleRate",
        )
    }

    fn io_format(&self, device: DeviceId) -> Result<StreamFormat, HostError> {
        let asbd: AudioStreamBasicDescription = Self::get_property(
            device,
            K_AUDIO_DEVICE_PROPERTY_STREAM_FORMAT,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
            "GetStreamFormat",
        )?;
        Ok(asbd.to_stream_format())
    }

    fn set_io_format(&self, device: DeviceId, format: &StreamFormat) -> Result<(), HostError> {
        let asbd = AudioStreamBasicDescription::from_stream_format(format);
        Self::set_property(
            device,
            K_AUDIO_DEVICE_PROPERTY_STREAM_FORMAT,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
            &asbd,
            "SetStreamFormat",
        )
    }

    fn io_buffer_frames(&self, device: DeviceId) -> Result<u32, HostError> {
        Self::get_property(
            device,
            K_AUDIO_DEVICE_PROPERTY_BUFFER_FRAME_SIZE,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
            "GetIOBufferSize",
        )
    }

    fn device_latency_frames(&self, device: DeviceId) -> Result<u32, HostError> {
        Self::get_property(
            device,
            K_AUDIO_DEVICE_PROPERTY_LATENCY,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
            "GetLatency",
        )
    }

    fn stream_latency_frames(&self, device: DeviceId) -> Option<u32> {
        // 流延迟挂在流对象上；设备可能一条输出流都不上报
        let stream = Self::first_output_stream(device)?;
        Self::get_property(
            stream,
            K_AUDIO_DEVICE_PROPERTY_LATENCY,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_GLOBAL,
            "GetStreamLatency",
        )
        .ok()
    }

    fn safety_offset_frames(&self, device: DeviceId) -> Result<u32, HostError> {
        Self::get_property(
            device,
            K_AUDIO_DEVICE_PROPERTY_SAFETY_OFFSET,
            K_AUDIO_OBJECT_PROPERTY_SCOPE_OUTPUT,
            "GetSafetyOffset",
        )
    }

    fn install_overload_listener(
        &self,
        device: DeviceId,
        sink: Arc<dyn OverloadSink>,
    ) -> Result<(), HostError> {
        let ctx = Arc::into_raw(Arc::new(ListenerCtx { sink }));
        let address = overload_address();
        let status = unsafe {
            AudioObjectAddPropertyListener(
                device,
                &address,
                overload_listener,
                ctx as *mut c_void,
            )
        };
        if status != NO_ERR {
            unsafe { drop(Arc::from_raw(ctx)) };
            return Err(HostError::new(status, "AddPropertyListener"));
        }
        self.state.lock().unwrap().listener_ptr = ctx;
        Ok(())
    }

    fn remove_overload_listener(&self, device: DeviceId) {
        let ctx = {
            let mut state = self.state.lock().unwrap();
            std::mem::replace(&mut state.listener_ptr, ptr::null())
        };
        if ctx.is_null() {
            return;
        }
        let address = overload_address();
        let status = unsafe {
            AudioObjectRemovePropertyListener(
                device,
                &address,
                overload_listener,
                ctx as *mut c_void,
            )
        };
        if status != NO_ERR {
            log::warn!("Failed to remove the overload listener (status {})", status);
        }
        unsafe { drop(Arc::from_raw(ctx)) };
    }

    fn install_render(
        &self,
        device: DeviceId,
        engine: Arc<RenderEngine>,
    ) -> Result<(), HostError> {
        let engine_ptr = Arc::into_raw(engine);
        let mut proc_id: AudioDeviceIOProcID = ptr::null_mut();
        let status = unsafe {
            AudioDeviceCreateIOProcID(
                device,
                Some(io_proc),
                engine_ptr as *mut c_void,
                &mut proc_id,
            )
        };
        if status != NO_ERR {
            unsafe { drop(Arc::from_raw(engine_ptr)) };
            return Err(HostError::new(status, "AddIOProc"));
        }

        let mut state = self.state.lock().unwrap();
        state.io_proc_id = proc_id;
        state.engine_ptr = engine_ptr;
        Ok(())
    }

    fn start_render(&self, device: DeviceId) -> Result<(), HostError> {
        let proc_id = self.state.lock().unwrap().io_proc_id;
        let status = unsafe { AudioDeviceStart(device, proc_id) };
        if status == NO_ERR {
            Ok(())
        } else {
            Err(HostError::new(status, "StartIOProc"))
        }
    }

    fn stop_render(&self, device: DeviceId) {
        let proc_id = self.state.lock().unwrap().io_proc_id;
        if proc_id.is_null() {
            return;
        }
        let status = unsafe { AudioDeviceStop(device, proc_id) };
        if status != NO_ERR {
            log::warn!("Failed to stop the IOProc (status {})", status);
        }
    }

    fn remove_render(&self, device: DeviceId) {
        let (proc_id, engine_ptr) = {
            let mut state = self.state.lock().unwrap();
            (
                std::mem::replace(&mut state.io_proc_id, ptr::null_mut()),
                std::mem::replace(&mut state.engine_ptr, ptr::null()),
            )
        };
        if proc_id.is_null() {
            return;
        }
        // DestroyIOProcID 返回后 HAL 保证回调不再运行，之后才能释放引擎
        let status = unsafe { AudioDeviceDestroyIOProcID(device, proc_id) };
        if status != NO_ERR {
            log::warn!("Failed to destroy the IOProc (status {})", status);
        }
        if !engine_ptr.is_null() {
            unsafe { drop(Arc::from_raw(engine_ptr)) };
        }
    }

    fn current_sample_time(&self, device: DeviceId) -> Result<i64, HostError> {
        let mut time = AudioTimeStamp::default();
        let status = unsafe { AudioDeviceGetCurrentTime(device, &mut time) };
        if status == NO_ERR {
            Ok(time.valid_sample_time())
        } else {
            Err(HostError::new(status, "GetCurrentTime"))
        }
    }

    fn release_device(&self, _device: DeviceId) {
        // 默认输出设备不是独占持有（没有 hog mode），没有要归还的句柄
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asbd_roundtrip() {
        let format = StreamFormat::hal_canonical(48000.0);
        let asbd = AudioStreamBasicDescription::from_stream_format(&format);
        assert_eq!(asbd.format_id, K_AUDIO_FORMAT_LINEAR_PCM);
        assert_eq!(asbd.to_stream_format(), format);
    }

    #[test]
    fn test_timestamp_validity_gate() {
        let mut ts = AudioTimeStamp::default();
        ts.sample_time = 12345.0;
        assert_eq!(ts.valid_sample_time(), 0);
        ts.flags = K_AUDIO_TIME_STAMP_SAMPLE_TIME_VALID;
        assert_eq!(ts.valid_sample_time(), 12345);
    }
}
