//! Macros for reducing boilerplate in the API layer.

/// Implement `FromRef<AppState>` for a field of `AppState`, so handlers can
/// extract it directly with `State<T>`.
///
/// ```ignore
/// impl_from_ref!(UsageRecorder, recorder);
/// // Expands to:
/// impl axum::extract::FromRef<AppState> for UsageRecorder {
///     fn from_ref(state: &AppState) -> Self {
///         state.recorder.clone()
///     }
/// }
/// ```
#[macro_export]
macro_rules! impl_from_ref {
    ($type:ty, $field:ident) => {
        impl axum::extract::FromRef<$crate::state::AppState> for $type {
            fn from_ref(state: &$crate::state::AppState) -> Self {
                state.$field.clone()
            }
        }
    };
}
