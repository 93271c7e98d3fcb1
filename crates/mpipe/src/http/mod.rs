mod content_type;
pub use self::content_type::{ContentTypeError, extract_boundary};

mod multipart;
pub use self::multipart::{DecoderLimits, MultipartDecoder, MultipartError};

mod part;
pub use self::part::{FormDecoder, FormEvent, Part, PartStream, PartStreamError};
