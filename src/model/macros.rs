/// Declares a node type together with its static field table.
///
/// ```
/// use std::sync::Arc;
/// use sombra_transport::graph_object;
///
/// graph_object! {
///     /// A point in model space.
///     pub struct Point as "Objects.Geometry.Point" {
///         pub x: f64,
///         pub y: f64,
///     }
/// }
///
/// graph_object! {
///     pub struct Polyline as "Objects.Geometry.Polyline" {
///         pub start: Option<Arc<Point>> => [detach],
///         pub vertices: Vec<f64> => [chunked(3000)],
///         pub units: Option<String> => [ignore_null],
///     }
/// }
///
/// let line = Polyline { vertices: vec![0.0, 1.0], ..Default::default() };
/// assert_eq!(line.vertices.len(), 2);
/// ```
///
/// Attributes map onto the builder methods of
/// [`PropertyAttributes`](crate::model::PropertyAttributes). An optional
/// trailing `with on_deserialized(path)` names a `fn(&mut Self)` run after the
/// deserializer has filled the instance.
#[macro_export]
macro_rules! graph_object {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident as $tag:literal {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $fname:ident : $fty:ty
                $(=> [ $( $attr:ident $( ( $($arg:expr),* ) )? ),* $(,)? ])?
            ),* $(,)?
        }
        $(with on_deserialized($hook:path))?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default, Clone)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $fname: $fty,
            )*
            /// Identity fields and dynamic properties.
            pub core: $crate::model::NodeCore,
        }

        impl $crate::model::NodeType for $name {
            const SPECKLE_TYPE: &'static str = $tag;
            const FIELDS: &'static [$crate::model::FieldDescriptor] = &[
                $(
                    $crate::model::FieldDescriptor::new(
                        stringify!($fname),
                        $crate::model::PropertyAttributes::INLINE
                            $($( .$attr( $($($arg),*)? ) )*)?,
                    ),
                )*
            ];
        }

        impl $crate::model::Node for $name {
            fn speckle_type(&self) -> &str {
                $tag
            }

            fn core(&self) -> &$crate::model::NodeCore {
                &self.core
            }

            fn core_mut(&mut self) -> &mut $crate::model::NodeCore {
                &mut self.core
            }

            fn fields(&self) -> &'static [$crate::model::FieldDescriptor] {
                <Self as $crate::model::NodeType>::FIELDS
            }

            #[allow(unused_variables)]
            fn get_field(&self, name: &str) -> ::std::option::Option<$crate::model::Value> {
                match name {
                    $(
                        stringify!($fname) => ::std::option::Option::Some(
                            $crate::model::FieldValue::to_value(&self.$fname),
                        ),
                    )*
                    _ => ::std::option::Option::None,
                }
            }

            #[allow(unused_variables)]
            fn set_field(
                &mut self,
                name: &str,
                value: $crate::model::Value,
            ) -> ::std::result::Result<bool, $crate::model::FieldError> {
                match name {
                    $(
                        stringify!($fname) => {
                            self.$fname = <$fty as $crate::model::FieldValue>::from_value(value)?;
                            self.core.clear_id();
                            ::std::result::Result::Ok(true)
                        }
                    )*
                    _ => ::std::result::Result::Ok(false),
                }
            }

            fn on_deserialized(&mut self) {
                $( $hook(self); )?
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn into_any(
                self: ::std::sync::Arc<Self>,
            ) -> ::std::sync::Arc<dyn ::std::any::Any + ::std::marker::Send + ::std::marker::Sync> {
                self
            }
        }
    };
}
