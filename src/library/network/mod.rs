pub mod socket_helpers;
