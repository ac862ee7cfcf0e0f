//! Display change notifications from a hidden window.
//!
//! Windows broadcasts layout changes to top-level windows only, so the
//! watcher owns an invisible top-level window on its own thread and
//! forwards every relevant message to a [`MonitorChangeSignal`].

use crate::signal::MonitorChangeSignal;

/// `WM_DISPLAYCHANGE` from winuser.h.
const WM_DISPLAYCHANGE: u32 = 0x007E;

/// Registered display change message ids; zero where registration failed.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(not(windows), allow(dead_code))]
struct DisplayMessages {
    uxd_display_change: u32,
    hot_unplug: u32,
    hotplug: u32,
}

#[cfg_attr(not(windows), allow(dead_code))]
impl DisplayMessages {
    fn is_display_change(&self, msg: u32) -> bool {
        // WM_DISPLAYCHANGE fires before the new layout is usable
        if msg == WM_DISPLAYCHANGE {
            return self.uxd_display_change == 0;
        }
        msg != 0 && [self.uxd_display_change, self.hot_unplug, self.hotplug].contains(&msg)
    }
}

#[cfg_attr(not(windows), allow(dead_code))]
struct WatcherContext {
    signal: MonitorChangeSignal,
    messages: DisplayMessages,
}

#[cfg(windows)]
pub use self::windows_impl::MonitorChangeWatcher;

#[cfg(windows)]
mod windows_impl {
    use std::ffi::c_void;
    use std::thread::{self, JoinHandle};

    use crossbeam_channel::Sender;
    use tracing::{debug, error, info, instrument, warn};
    use windows::core::{w, PCWSTR};
    use windows::Win32::Foundation::{HINSTANCE, HWND, LPARAM, LRESULT, WPARAM};
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::UI::WindowsAndMessaging::{
        CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW,
        GetWindowLongPtrW, PostMessageW, RegisterClassW, RegisterWindowMessageW,
        SetWindowLongPtrW, TranslateMessage, CREATESTRUCTW, GWLP_USERDATA, HMENU, MSG,
        WINDOW_EX_STYLE, WM_CREATE, WM_USER, WNDCLASSW, WS_OVERLAPPEDWINDOW,
    };

    use super::{DisplayMessages, WatcherContext};
    use crate::signal::MonitorChangeSignal;
    use crate::{EngineError, EngineResult};

    const WM_STOP_WATCHER: u32 = WM_USER + 1;
    const CLASS_NAME: PCWSTR = w!("XrdeskMonitorChangeWatcher");

    /// Thread with a hidden window that notifies a signal on display changes.
    pub struct MonitorChangeWatcher {
        /// Raw `HWND`; `HWND` itself is not `Send`.
        window: isize,
        thread: Option<JoinHandle<()>>,
    }

    impl MonitorChangeWatcher {
        /// Starts the watcher thread and waits until its window exists.
        #[instrument(name = "monitor_watcher_start", skip_all)]
        pub fn start(signal: MonitorChangeSignal) -> EngineResult<Self> {
            let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
            let thread = thread::Builder::new()
                .name("xrdesk-monitor-changes".into())
                .spawn(move || watcher_thread(signal, ready_tx))?;

            match ready_rx.recv() {
                Ok(Ok(window)) => {
                    info!("Monitor change watcher running");
                    Ok(Self {
                        window,
                        thread: Some(thread),
                    })
                }
                Ok(Err(message)) => {
                    let _ = thread.join();
                    Err(EngineError::Watcher(message))
                }
                Err(_) => {
                    let _ = thread.join();
                    Err(EngineError::Watcher(
                        "watcher thread exited during startup".into(),
                    ))
                }
            }
        }

        /// Stops the message loop and joins the thread.
        pub fn shutdown(&mut self) {
            let Some(thread) = self.thread.take() else {
                return;
            };
            let hwnd = HWND(self.window as *mut c_void);
            if let Err(e) = unsafe { PostMessageW(hwnd, WM_STOP_WATCHER, WPARAM(0), LPARAM(0)) } {
                // Joining would hang on a loop that never hears about it
                warn!(error = %e, "Failed to stop monitor change watcher");
                return;
            }
            if thread.join().is_err() {
                error!("Monitor change watcher thread panicked");
            }
            debug!("Monitor change watcher stopped");
        }
    }

    impl Drop for MonitorChangeWatcher {
        fn drop(&mut self) {
            self.shutdown();
        }
    }

    fn register_message(name: PCWSTR, label: &str) -> u32 {
        let id = unsafe { RegisterWindowMessageW(name) };
        if id == 0 {
            error!(
                message = label,
                error = %windows::core::Error::from_win32(),
                "RegisterWindowMessageW failed"
            );
        }
        id
    }

    fn watcher_thread(signal: MonitorChangeSignal, ready_tx: Sender<Result<isize, String>>) {
        let messages = DisplayMessages {
            uxd_display_change: register_message(
                w!("UxdDisplayChangeMessage"),
                "UxdDisplayChangeMessage",
            ),
            hot_unplug: register_message(w!("HotUnplugDetected"), "HotUnplugDetected"),
            hotplug: register_message(w!("HotplugDetected"), "HotplugDetected"),
        };
        // Outlives the window: dropped only after DestroyWindow returns
        let context = Box::new(WatcherContext { signal, messages });

        let hwnd = match create_window(&context) {
            Ok(hwnd) => hwnd,
            Err(e) => {
                error!(error = %e, "CreateWindowExW failed for the monitor change watcher");
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
        };
        let _ = ready_tx.send(Ok(hwnd.0 as isize));

        debug!("Monitor change loop running");
        run_message_loop();
        debug!("Monitor change loop closing");

        if let Err(e) = unsafe { DestroyWindow(hwnd) } {
            debug!(error = %e, "DestroyWindow failed");
        }
        drop(context);
    }

    fn create_window(context: &WatcherContext) -> windows::core::Result<HWND> {
        let instance: HINSTANCE = unsafe { GetModuleHandleW(None) }?.into();

        let class = WNDCLASSW {
            lpfnWndProc: Some(watcher_wnd_proc),
            hInstance: instance,
            lpszClassName: CLASS_NAME,
            ..Default::default()
        };
        // Fails harmlessly when a previous watcher registered the class
        unsafe { RegisterClassW(&class) };

        // Never shown; message-only windows miss broadcasts
        unsafe {
            CreateWindowExW(
                WINDOW_EX_STYLE::default(),
                CLASS_NAME,
                PCWSTR::null(),
                WS_OVERLAPPEDWINDOW,
                0,
                0,
                0,
                0,
                HWND::default(),
                HMENU::default(),
                instance,
                Some(context as *const WatcherContext as *const c_void),
            )
        }
    }

    fn run_message_loop() {
        let mut msg = MSG::default();
        loop {
            let ret = unsafe { GetMessageW(&mut msg, HWND::default(), 0, 0) };
            if ret.0 == 0 || ret.0 == -1 || msg.message == WM_STOP_WATCHER {
                break;
            }
            unsafe {
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }
    }

    unsafe extern "system" fn watcher_wnd_proc(
        hwnd: HWND,
        msg: u32,
        wparam: WPARAM,
        lparam: LPARAM,
    ) -> LRESULT {
        if msg == WM_CREATE {
            let create = unsafe { &*(lparam.0 as *const CREATESTRUCTW) };
            unsafe { SetWindowLongPtrW(hwnd, GWLP_USERDATA, create.lpCreateParams as isize) };
            return unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) };
        }

        let context = unsafe { GetWindowLongPtrW(hwnd, GWLP_USERDATA) } as *const WatcherContext;
        if let Some(context) = unsafe { context.as_ref() } {
            if context.messages.is_display_change(msg) {
                debug!(msg, "Display change message");
                context.signal.notify();
            }
        }
        unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_change_used_only_as_fallback() {
        let fallback = DisplayMessages::default();
        assert!(fallback.is_display_change(WM_DISPLAYCHANGE));
        assert!(!fallback.is_display_change(0));

        let registered = DisplayMessages {
            uxd_display_change: 0xC100,
            hot_unplug: 0xC101,
            hotplug: 0xC102,
        };
        assert!(!registered.is_display_change(WM_DISPLAYCHANGE));
        assert!(registered.is_display_change(0xC100));
        assert!(registered.is_display_change(0xC101));
        assert!(registered.is_display_change(0xC102));
        assert!(!registered.is_display_change(0xC103));
    }

    #[test]
    fn test_partial_registration() {
        let messages = DisplayMessages {
            uxd_display_change: 0,
            hot_unplug: 0,
            hotplug: 0xC102,
        };
        assert!(messages.is_display_change(WM_DISPLAYCHANGE));
        assert!(messages.is_display_change(0xC102));
        assert!(!messages.is_display_change(0));
    }
}
