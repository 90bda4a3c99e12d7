//! Error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use kmutex::ResultCode;
            /// assert_eq!(ResultCode::NotOwner.as_str(), "NotOwner");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the mutex operations can
    /// return.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// The specified combination of options is not allowed.
        InvalidOption = -17,
        /// The mutex handle doesn't refer to a live mutex (e.g., it was
        /// destroyed).
        InvalidHandle = -18,
        /// The current context disallows the operation. The caller is not a
        /// task, or CPU Lock is active.
        RestrictedContext = -25,
        /// The caller does not own the mutex (or, for
        /// [`System::task_unsafe`](crate::System::task_unsafe), has no
        /// outstanding `task_safe` call).
        NotOwner = -29,
        /// Another task's event registration exists on the mutex.
        AlreadyRegistered = -40,
        /// The mutex has no event registration.
        NotRegistered = -41,
        /// The operation timed out.
        Timeout = -50,
        /// The mutex was destroyed while the caller was waiting for it.
        Destroyed = -51,
        /// The kernel couldn't post the registered events to the registered
        /// task.
        EventSendFailed = -52,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

/// Defines an error type that only appears as a component of other error
/// types. Each `#[into]` names an error type that the new type can be
/// converted into.
macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_error! {
    mod init_mutex_error {}
    /// Error type for [`Mutex::init`].
    ///
    /// [`Mutex::init`]: crate::Mutex::init
    pub enum InitMutexError {
        /// CPU Lock is active.
        RestrictedContext,
        /// [`INVERSION_SAFE`] was specified without [`Q_PRIORITY`].
        ///
        /// [`INVERSION_SAFE`]: crate::MutexOptions::INVERSION_SAFE
        /// [`Q_PRIORITY`]: crate::MutexOptions::Q_PRIORITY
        InvalidOption,
    }
}

define_error! {
    mod create_mutex_error {}
    /// Error type for [`Mutex::create`].
    ///
    /// [`Mutex::create`]: crate::Mutex::create
    pub enum CreateMutexError: InitMutexError {
        /// CPU Lock is active.
        RestrictedContext,
        /// [`INVERSION_SAFE`] was specified without [`Q_PRIORITY`].
        ///
        /// [`INVERSION_SAFE`]: crate::MutexOptions::INVERSION_SAFE
        /// [`Q_PRIORITY`]: crate::MutexOptions::Q_PRIORITY
        InvalidOption,
    }
}

define_error! {
    mod take_mutex_error {}
    /// Error type for [`Mutex::take`] and [`Mutex::try_take`].
    ///
    /// [`Mutex::take`]: crate::Mutex::take
    /// [`Mutex::try_take`]: crate::Mutex::try_take
    pub enum TakeMutexError {
        /// The mutex is not live.
        InvalidHandle,
        /// CPU Lock is active, or the current context is not a task context.
        RestrictedContext,
        /// The mutex couldn't be acquired before the timeout expired.
        Timeout,
        /// The mutex was destroyed while the caller was waiting for it.
        Destroyed,
    }
}

define_error! {
    mod give_mutex_error {}
    /// Error type for [`Mutex::give`].
    ///
    /// [`Mutex::give`]: crate::Mutex::give
    pub enum GiveMutexError {
        /// The mutex is not live.
        InvalidHandle,
        /// CPU Lock is active, or the current context is not a task context.
        RestrictedContext,
        /// The caller doesn't own the mutex.
        NotOwner,
        /// The mutex was released, but the registered events couldn't be
        /// posted and the mutex was created with
        /// [`EVENTSEND_ERR_NOTIFY`](crate::MutexOptions::EVENTSEND_ERR_NOTIFY).
        EventSendFailed,
    }
}

define_error! {
    mod give_force_mutex_error {}
    /// Error type for [`Mutex::give_force`].
    ///
    /// [`Mutex::give_force`]: crate::Mutex::give_force
    pub enum GiveForceMutexError {
        /// The mutex is not live.
        InvalidHandle,
        /// CPU Lock is active, or the current context is not a task context.
        RestrictedContext,
        /// The mutex was released, but the registered events couldn't be
        /// posted and the mutex was created with
        /// [`EVENTSEND_ERR_NOTIFY`](crate::MutexOptions::EVENTSEND_ERR_NOTIFY).
        EventSendFailed,
    }
}

define_error! {
    mod destroy_mutex_error {}
    /// Error type for [`Mutex::destroy`].
    ///
    /// [`Mutex::destroy`]: crate::Mutex::destroy
    pub enum DestroyMutexError {
        /// The mutex is not live.
        InvalidHandle,
        /// CPU Lock is active, or the current context is not a task context.
        RestrictedContext,
    }
}

define_error! {
    mod query_mutex_error {}
    /// Error type for the query methods of [`Mutex`].
    ///
    /// [`Mutex`]: crate::Mutex
    pub enum QueryMutexError {
        /// The mutex is not live.
        InvalidHandle,
        /// CPU Lock is active.
        RestrictedContext,
    }
}

define_error! {
    mod query_task_error {}
    /// Error type for the per-task query methods of [`System`].
    ///
    /// [`System`]: crate::System
    pub enum QueryTaskError {
        /// CPU Lock is active.
        RestrictedContext,
    }
}

define_error! {
    mod register_event_error {}
    /// Error type for [`Mutex::register_event`].
    ///
    /// [`Mutex::register_event`]: crate::Mutex::register_event
    pub enum RegisterEventError {
        /// The mutex is not live.
        InvalidHandle,
        /// CPU Lock is active, or the current context is not a task context.
        RestrictedContext,
        /// Another task has registered for the mutex's events, and
        /// [`ALLOW_OVERWRITE`](crate::EventOptions::ALLOW_OVERWRITE) was not
        /// specified.
        AlreadyRegistered,
        /// [`SEND_IF_FREE`](crate::EventOptions::SEND_IF_FREE) was
        /// specified, the mutex was free, and the events couldn't be posted.
        /// The registration was not kept.
        EventSendFailed,
    }
}

define_error! {
    mod unregister_event_error {}
    /// Error type for [`Mutex::unregister_event`].
    ///
    /// [`Mutex::unregister_event`]: crate::Mutex::unregister_event
    pub enum UnregisterEventError {
        /// The mutex is not live.
        InvalidHandle,
        /// CPU Lock is active, or the current context is not a task context.
        RestrictedContext,
        /// The mutex has no event registration.
        NotRegistered,
    }
}

define_error! {
    mod task_safety_error {}
    /// Error type for [`System::task_safe`] and [`System::task_unsafe`].
    ///
    /// [`System::task_safe`]: crate::System::task_safe
    /// [`System::task_unsafe`]: crate::System::task_unsafe
    pub enum TaskSafetyError {
        /// CPU Lock is active, or the current context is not a task context.
        RestrictedContext,
        /// [`System::task_unsafe`](crate::System::task_unsafe) was called by
        /// a task with no outstanding
        /// [`System::task_safe`](crate::System::task_safe) call.
        NotOwner,
    }
}

define_suberror! {
    /// `RestrictedContext`
    #[into(InitMutexError)]
    #[into(CreateMutexError)]
    #[into(TakeMutexError)]
    #[into(GiveMutexError)]
    #[into(GiveForceMutexError)]
    #[into(DestroyMutexError)]
    #[into(QueryMutexError)]
    #[into(QueryTaskError)]
    #[into(RegisterEventError)]
    #[into(UnregisterEventError)]
    #[into(TaskSafetyError)]
    pub enum BadContextError {
        RestrictedContext,
    }
}

define_suberror! {
    /// `InvalidHandle`
    #[into(TakeMutexError)]
    #[into(GiveMutexError)]
    #[into(GiveForceMutexError)]
    #[into(DestroyMutexError)]
    #[into(QueryMutexError)]
    #[into(RegisterEventError)]
    #[into(UnregisterEventError)]
    pub enum BadHandleError {
        InvalidHandle,
    }
}

define_suberror! {
    /// `EventSendFailed`. Returned by
    /// [`KernelTraits::send_events`](crate::KernelTraits::send_events) when the
    /// target task can't receive events.
    #[into(GiveMutexError)]
    #[into(GiveForceMutexError)]
    #[into(RegisterEventError)]
    pub enum EventSendError {
        EventSendFailed,
    }
}
