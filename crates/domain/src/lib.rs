//! 在线状态系统核心领域模型
//!
//! 包含会话、在线状态、隐私过滤等核心实体，以及相关的业务规则。
//! 这一层不做任何 I/O，状态推导和隐私投影都是纯函数。

pub mod errors;
pub mod presence;
pub mod session;
pub mod value_objects;

// 重新导出常用类型
pub use errors::*;
pub use presence::*;
pub use session::*;
pub use value_objects::*;
