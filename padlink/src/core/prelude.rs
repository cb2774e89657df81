pub use crate::core::logging::init_logger;
pub use crate::core::logging::{debug, error, info, trace, warn};
pub use crate::core::util::HashMap;
pub use crate::core::util::HashSet;
pub use crate::core::util::as_millis;
pub use crate::core::util::hex_string;
pub use crate::core::util::millis;
pub use crate::ternary;
