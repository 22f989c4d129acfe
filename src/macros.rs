//! Declarative helpers shared by the protocol modules.

/// Defines a closed enum whose variants map one-to-one onto wire strings.
///
/// Generates `as_str()`, `from_wire()`, an `ALL` table, `Display`, and a
/// `FromStr` that fails with the named [`GatewayError`](crate::error::GatewayError) variant.
macro_rules! define_wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $err:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $wire:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant,
            )+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The name used for this variant on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire,)+
                }
            }

            /// Looks up a variant by its wire name.
            pub fn from_wire(s: &str) -> Option<Self> {
                match s {
                    $($wire => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::GatewayError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Self::from_wire(s).ok_or_else(|| {
                    $crate::error::GatewayError::$err(s.to_string())
                })
            }
        }
    };
}
